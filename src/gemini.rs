//! Gemini Live API wire types
//!
//! Typed JSON messages exchanged over the `BidiGenerateContent` WebSocket.
//! Client messages are externally tagged (`{"setup": {...}}`); server
//! messages are a single object where any of the top-level fields may be
//! present.

use crate::config::AssistantConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_tungstenite::tungstenite::Error as WsError;

/// Live API WebSocket endpoint. The API key is appended as a query parameter.
pub const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Content made of parts, used for the system instruction.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// Built-in tools the model may invoke.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Tool {
    CodeExecution {},
    GoogleSearch {},
}

/// Enables transcription of one audio direction. Serialised as `{}`.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct AudioTranscriptionConfig {}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
}

impl BidiGenerateContentSetup {
    /// Audio-out setup with transcription in both directions.
    pub fn from_config(config: &AssistantConfig) -> Self {
        let model = if config.model_name.starts_with("models/") {
            config.model_name.clone()
        } else {
            format!("models/{}", config.model_name)
        };

        let voice = config.voice_name.trim();
        let speech_config = (!voice.is_empty()).then(|| SpeechConfig {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: voice.to_string(),
                },
            },
        });

        let instruction = config.system_instruction.trim();
        let system_instruction = (!instruction.is_empty()).then(|| Content {
            parts: vec![Part {
                text: Some(instruction.to_string()),
                ..Default::default()
            }],
        });

        let mut tools = vec![Tool::CodeExecution {}];
        if config.enable_google_search {
            tools.push(Tool::GoogleSearch {});
        }

        Self {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config,
            },
            system_instruction,
            tools,
            input_audio_transcription: Some(AudioTranscriptionConfig {}),
            output_audio_transcription: Some(AudioTranscriptionConfig {}),
        }
    }
}

/// Base64 media payload with its MIME tag.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub data: String,
    pub mime_type: String,
}

/// A chunk of realtime input
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    pub fn audio(blob: Blob) -> Self {
        Self::RealtimeInput(RealtimeInput {
            audio: Some(blob),
            audio_stream_end: None,
        })
    }

    pub fn audio_stream_end() -> Self {
        Self::RealtimeInput(RealtimeInput {
            audio: None,
            audio_stream_end: Some(true),
        })
    }
}

/// Server -> client message. Any combination of fields may be set.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_complete: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_content: Option<ServerContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_cancellation: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub go_away: Option<GoAway>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_resumption_update: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_transcription: Option<Transcription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_transcription: Option<Transcription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grounding_metadata: Option<Map<String, Value>>,
    pub turn_complete: bool,
    pub interrupted: bool,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Transcription {
    pub text: String,
    #[serde(alias = "isFinal")]
    pub finished: bool,
}

/// One content part of a model turn.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable_code: Option<ExecutableCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_execution_result: Option<CodeExecutionOutput>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

impl InlineData {
    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutableCode {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CodeExecutionOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Advance notice that the server will close the connection.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct GoAway {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_left: Option<String>,
}

/// Error type for the Live API transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    /// Send attempted after the socket started closing.
    #[error("WebSocket is already in CLOSING or CLOSED state")]
    Closing,

    #[error("Session setup rejected: {0}")]
    Rejected(String),

    #[error("Timed out connecting to the Live API")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_setup_serialization() {
        let config = AssistantConfig::default();
        let msg = ClientMessage::Setup(BidiGenerateContentSetup::from_config(&config));
        let parsed = serde_json::to_value(&msg).unwrap();

        let setup = &parsed["setup"];
        assert_eq!(
            setup["model"],
            "models/gemini-2.5-flash-native-audio-preview-09-2025"
        );
        assert_eq!(setup["generationConfig"]["responseModalities"], json!(["AUDIO"]));
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Puck"
        );
        assert_eq!(setup["inputAudioTranscription"], json!({}));
        assert_eq!(setup["outputAudioTranscription"], json!({}));
        assert_eq!(
            setup["tools"],
            json!([{"codeExecution": {}}, {"googleSearch": {}}])
        );
        assert!(setup["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("Orbit"));
    }

    #[test]
    fn test_setup_without_voice_or_search() {
        let config = AssistantConfig {
            model_name: "models/custom".to_string(),
            voice_name: "  ".to_string(),
            enable_google_search: false,
            ..Default::default()
        };
        let parsed = serde_json::to_value(BidiGenerateContentSetup::from_config(&config)).unwrap();

        assert_eq!(parsed["model"], "models/custom");
        assert!(parsed["generationConfig"].get("speechConfig").is_none());
        assert_eq!(parsed["tools"], json!([{"codeExecution": {}}]));
    }

    #[test]
    fn test_realtime_audio_serialization() {
        let msg = ClientMessage::audio(Blob {
            data: "AAA=".to_string(),
            mime_type: "audio/pcm;rate=16000".to_string(),
        });
        let parsed = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            parsed,
            json!({"realtimeInput": {"audio": {"data": "AAA=", "mimeType": "audio/pcm;rate=16000"}}})
        );

        let end = serde_json::to_value(ClientMessage::audio_stream_end()).unwrap();
        assert_eq!(end, json!({"realtimeInput": {"audioStreamEnd": true}}));
    }

    #[test]
    fn test_server_content_deserialization() {
        let text = json!({
            "serverContent": {
                "inputTranscription": {"text": "hello", "finished": true},
                "outputTranscription": {"text": "hi", "isFinal": false},
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}},
                    {"executableCode": {"language": "PYTHON", "code": "print(1)"}},
                    {"codeExecutionResult": {"outcome": "OUTCOME_OK", "output": "1\n"}}
                ]},
                "groundingMetadata": {"webSearchQueries": ["q"]},
                "turnComplete": true
            },
            "usageMetadata": {"totalTokenCount": 12}
        })
        .to_string();

        let msg: ServerMessage = serde_json::from_str(&text).unwrap();
        let content = msg.server_content.unwrap();
        let input = content.input_transcription.unwrap();
        assert_eq!(input.text, "hello");
        assert!(input.finished);
        assert!(!content.output_transcription.unwrap().finished);

        let parts = content.model_turn.unwrap().parts;
        assert!(parts[0].inline_data.as_ref().unwrap().is_audio());
        assert_eq!(
            parts[1].executable_code.as_ref().unwrap().code.as_deref(),
            Some("print(1)")
        );
        assert_eq!(
            parts[2].code_execution_result.as_ref().unwrap().outcome.as_deref(),
            Some("OUTCOME_OK")
        );
        assert!(content.grounding_metadata.is_some());
        assert!(content.turn_complete);
        assert!(!content.interrupted);
    }

    #[test]
    fn test_other_server_messages() {
        let msg: ServerMessage = serde_json::from_str(r#"{"setupComplete": {}}"#).unwrap();
        assert!(msg.setup_complete.is_some());
        assert!(msg.server_content.is_none());

        let msg: ServerMessage = serde_json::from_str(r#"{"goAway": {"timeLeft": "10s"}}"#).unwrap();
        assert_eq!(msg.go_away.unwrap().time_left.as_deref(), Some("10s"));
    }

    #[test]
    fn test_closing_error_message() {
        assert!(TransportError::Closing
            .to_string()
            .contains("CLOSING or CLOSED"));
    }
}
