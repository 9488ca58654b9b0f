//! Events emitted by the session to its single consumer

use crate::transcript::{InProgressTranscript, TranscriptEntry};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use tokio::sync::mpsc;

/// Sending half of the session event stream.
pub type EventSink = mpsc::UnboundedSender<SessionEvent>;

/// Receiving half of the session event stream.
pub type EventStream = mpsc::UnboundedReceiver<SessionEvent>;

/// Create a connected event sink and stream.
pub fn channel() -> (EventSink, EventStream) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Ai,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Ai => "ai",
        }
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of the live session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Active,
    Error,
}

impl SessionState {
    /// Connecting or Active.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connecting | Self::Active)
    }
}

/// One transcription fragment as delivered by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionUpdate {
    pub text: String,
    pub is_final: bool,
    pub speaker: Speaker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    GoogleSearch,
    CodeExecution,
}

impl ToolName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GoogleSearch => "google_search",
            Self::CodeExecution => "code_execution",
        }
    }
}

/// Code-execution fields gathered over one turn.
///
/// Each field may arrive in a different server event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CodeExecutionResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// Base64 image produced by the executed code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl CodeExecutionResult {
    pub fn is_empty(&self) -> bool {
        self.code.is_none() && self.output.is_none() && self.outcome.is_none() && self.image.is_none()
    }
}

/// Payload of a tool-call signal
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    /// The model started a web search in this turn.
    SearchInProgress,

    /// Final search result: the turn's spoken answer plus the grounding
    /// fields exactly as the service sent them.
    Search {
        ai_response: String,
        grounding: Map<String, Value>,
    },

    CodeExecution(CodeExecutionResult),
}

impl ToolResult {
    /// JSON payload in the shape the UI renders.
    pub fn to_json(&self) -> Value {
        match self {
            Self::SearchInProgress => serde_json::json!({ "inProgress": true }),
            Self::Search {
                ai_response,
                grounding,
            } => {
                let mut object = Map::new();
                object.insert("aiResponse".to_string(), Value::String(ai_response.clone()));
                for (key, value) in grounding {
                    object.insert(key.clone(), value.clone());
                }
                Value::Object(object)
            }
            Self::CodeExecution(result) => {
                serde_json::to_value(result).unwrap_or_else(|_| Value::Object(Map::new()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallUpdate {
    pub tool_name: ToolName,
    pub result: ToolResult,
}

impl ToolCallUpdate {
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "toolName": self.tool_name.as_str(),
            "result": self.result.to_json(),
        })
    }
}

/// Everything the session reports to its consumer, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Transcription(TranscriptionUpdate),
    TranscriptFinalized(TranscriptEntry),
    InProgress(InProgressTranscript),
    ToolCall(ToolCallUpdate),
    Error(String),
}
