//! Server event demultiplexer
//!
//! A `serverContent` message is split into a fixed-order list of
//! [`ServerEvent`]s, and each event is folded into the current [`Turn`],
//! producing the [`Signal`]s the session acts on. Nothing here touches a
//! socket or a device.

use crate::events::{
    CodeExecutionResult, Speaker, ToolCallUpdate, ToolName, ToolResult, TranscriptionUpdate,
};
use crate::gemini::{Part, ServerContent};
use crate::pcm;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Substring of a code-execution output that means the model is searching
/// the web rather than running code.
pub const SEARCH_MARKER: &str = "Google Search";

/// One kind of signal carried by a server content message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Transcription {
        speaker: Speaker,
        text: String,
        finished: bool,
    },
    ContentParts(Vec<Part>),
    Grounding(Map<String, Value>),
    TurnComplete,
    Interrupted,
}

/// Split server content into events, in processing order.
pub fn classify(content: ServerContent) -> Vec<ServerEvent> {
    let mut events = Vec::new();

    if let Some(t) = content.input_transcription {
        events.push(ServerEvent::Transcription {
            speaker: Speaker::User,
            text: t.text,
            finished: t.finished,
        });
    }
    if let Some(t) = content.output_transcription {
        events.push(ServerEvent::Transcription {
            speaker: Speaker::Ai,
            text: t.text,
            finished: t.finished,
        });
    }
    if let Some(turn) = content.model_turn {
        if !turn.parts.is_empty() {
            events.push(ServerEvent::ContentParts(turn.parts));
        }
    }
    if let Some(grounding) = content.grounding_metadata {
        events.push(ServerEvent::Grounding(grounding));
    }
    if content.turn_complete {
        events.push(ServerEvent::TurnComplete);
    }
    if content.interrupted {
        events.push(ServerEvent::Interrupted);
    }

    events
}

/// What the session must do in response to an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Transcription(TranscriptionUpdate),
    ToolCall(ToolCallUpdate),
    /// Raw 16-bit PCM to decode and schedule. May be empty.
    PlayAudio(Vec<u8>),
    Interrupt,
    TurnComplete,
}

/// Aggregation state for one user/assistant exchange.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Turn {
    ai_response: String,
    code_execution: CodeExecutionResult,
    search_active: bool,
}

impl Turn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ai_response(&self) -> &str {
        &self.ai_response
    }

    pub fn code_execution(&self) -> &CodeExecutionResult {
        &self.code_execution
    }

    pub fn search_active(&self) -> bool {
        self.search_active
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Fold one event into the turn.
    pub fn apply(&mut self, event: ServerEvent) -> Vec<Signal> {
        match event {
            ServerEvent::Transcription {
                speaker,
                text,
                finished,
            } => {
                if speaker == Speaker::Ai {
                    self.ai_response.push_str(&text);
                }
                vec![Signal::Transcription(TranscriptionUpdate {
                    text,
                    is_final: finished,
                    speaker,
                })]
            }
            ServerEvent::ContentParts(parts) => self.apply_parts(parts),
            ServerEvent::Grounding(grounding) => {
                self.search_active = true;
                vec![Signal::ToolCall(ToolCallUpdate {
                    tool_name: ToolName::GoogleSearch,
                    result: ToolResult::Search {
                        ai_response: self.ai_response.clone(),
                        grounding,
                    },
                })]
            }
            ServerEvent::TurnComplete => {
                let mut signals = Vec::new();
                let code = std::mem::take(&mut self.code_execution);
                if !code.is_empty() {
                    signals.push(Signal::ToolCall(ToolCallUpdate {
                        tool_name: ToolName::CodeExecution,
                        result: ToolResult::CodeExecution(code),
                    }));
                }
                self.reset();
                signals.push(Signal::TurnComplete);
                signals
            }
            ServerEvent::Interrupted => vec![Signal::Interrupt],
        }
    }

    fn apply_parts(&mut self, parts: Vec<Part>) -> Vec<Signal> {
        let mut signals = Vec::new();
        let mut audio_taken = false;

        for part in parts {
            let marks_search = part
                .code_execution_result
                .as_ref()
                .and_then(|r| r.output.as_deref())
                .is_some_and(|output| output.contains(SEARCH_MARKER));
            if marks_search {
                if !self.search_active {
                    self.search_active = true;
                    signals.push(Signal::ToolCall(ToolCallUpdate {
                        tool_name: ToolName::GoogleSearch,
                        result: ToolResult::SearchInProgress,
                    }));
                }
                continue;
            }

            if let Some(code) = part.executable_code.and_then(|c| c.code) {
                self.code_execution.code = Some(code);
            }

            if let Some(result) = part.code_execution_result {
                if result.output.is_some() {
                    self.code_execution.output = result.output;
                }
                if result.outcome.is_some() {
                    self.code_execution.outcome = result.outcome;
                }
            }

            if let Some(inline) = part.inline_data {
                if inline.is_image() {
                    if self.search_active {
                        debug!("Dropping image part, search is active this turn");
                    } else {
                        self.code_execution.image = Some(inline.data);
                    }
                } else if inline.is_audio() {
                    if audio_taken {
                        warn!("Ignoring additional audio part in one server message");
                        continue;
                    }
                    audio_taken = true;
                    let bytes = pcm::decode_bytes(&inline.data).unwrap_or_else(|e| {
                        warn!("Discarding undecodable audio payload: {}", e);
                        Vec::new()
                    });
                    signals.push(Signal::PlayAudio(bytes));
                }
            }
        }

        signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::{CodeExecutionOutput, Content, ExecutableCode, InlineData, Transcription};
    use serde_json::json;

    fn code_part(code: &str) -> Part {
        Part {
            executable_code: Some(ExecutableCode {
                language: Some("PYTHON".to_string()),
                code: Some(code.to_string()),
            }),
            ..Default::default()
        }
    }

    fn result_part(outcome: &str, output: &str) -> Part {
        Part {
            code_execution_result: Some(CodeExecutionOutput {
                outcome: Some(outcome.to_string()),
                output: Some(output.to_string()),
            }),
            ..Default::default()
        }
    }

    fn inline_part(mime_type: &str, data: &str) -> Part {
        Part {
            inline_data: Some(InlineData {
                mime_type: mime_type.to_string(),
                data: data.to_string(),
            }),
            ..Default::default()
        }
    }

    fn tool_calls(signals: &[Signal]) -> Vec<&ToolCallUpdate> {
        signals
            .iter()
            .filter_map(|s| match s {
                Signal::ToolCall(update) => Some(update),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_classify_orders_signals() {
        let content = ServerContent {
            interrupted: true,
            turn_complete: true,
            grounding_metadata: Some(Map::new()),
            model_turn: Some(Content {
                parts: vec![code_part("x = 1")],
            }),
            output_transcription: Some(Transcription {
                text: "b".to_string(),
                finished: false,
            }),
            input_transcription: Some(Transcription {
                text: "a".to_string(),
                finished: true,
            }),
        };

        let events = classify(content);
        assert_eq!(events.len(), 6);
        assert!(matches!(
            &events[0],
            ServerEvent::Transcription { speaker: Speaker::User, finished: true, .. }
        ));
        assert!(matches!(
            &events[1],
            ServerEvent::Transcription { speaker: Speaker::Ai, .. }
        ));
        assert!(matches!(events[2], ServerEvent::ContentParts(_)));
        assert!(matches!(events[3], ServerEvent::Grounding(_)));
        assert_eq!(events[4], ServerEvent::TurnComplete);
        assert_eq!(events[5], ServerEvent::Interrupted);
    }

    #[test]
    fn test_code_execution_aggregates_across_events() {
        let mut turn = Turn::new();

        assert!(turn.apply(ServerEvent::ContentParts(vec![code_part("print(1)")])).is_empty());
        assert!(turn
            .apply(ServerEvent::ContentParts(vec![result_part("OUTCOME_OK", "2")]))
            .is_empty());

        let signals = turn.apply(ServerEvent::TurnComplete);
        assert_eq!(signals.len(), 2);
        assert_eq!(
            signals[0],
            Signal::ToolCall(ToolCallUpdate {
                tool_name: ToolName::CodeExecution,
                result: ToolResult::CodeExecution(CodeExecutionResult {
                    code: Some("print(1)".to_string()),
                    output: Some("2".to_string()),
                    outcome: Some("OUTCOME_OK".to_string()),
                    image: None,
                }),
            })
        );
        assert_eq!(signals[1], Signal::TurnComplete);
        assert_eq!(turn, Turn::new());
    }

    #[test]
    fn test_last_code_fragment_wins() {
        let mut turn = Turn::new();
        turn.apply(ServerEvent::ContentParts(vec![code_part("a"), code_part("b")]));
        assert_eq!(turn.code_execution().code.as_deref(), Some("b"));
    }

    #[test]
    fn test_search_marker_suppresses_image() {
        let mut turn = Turn::new();

        let signals = turn.apply(ServerEvent::ContentParts(vec![
            result_part("OUTCOME_OK", "Looking up Google Search results"),
            inline_part("image/png", "iVBORw0KGgo="),
        ]));
        let calls = tool_calls(&signals);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, ToolName::GoogleSearch);
        assert_eq!(calls[0].result, ToolResult::SearchInProgress);
        assert!(turn.search_active());
        assert!(turn.code_execution().is_empty());

        // The marker part itself is not aggregated, so nothing is reported.
        let signals = turn.apply(ServerEvent::TurnComplete);
        assert_eq!(signals, vec![Signal::TurnComplete]);
    }

    #[test]
    fn test_search_in_progress_emitted_once_per_turn() {
        let mut turn = Turn::new();
        let marker = || result_part("OUTCOME_OK", "Google Search");

        let first = turn.apply(ServerEvent::ContentParts(vec![marker()]));
        let second = turn.apply(ServerEvent::ContentParts(vec![marker()]));
        assert_eq!(tool_calls(&first).len(), 1);
        assert!(tool_calls(&second).is_empty());

        turn.apply(ServerEvent::TurnComplete);
        let next_turn = turn.apply(ServerEvent::ContentParts(vec![marker()]));
        assert_eq!(tool_calls(&next_turn).len(), 1);
    }

    #[test]
    fn test_image_without_search_goes_to_code_execution() {
        let mut turn = Turn::new();
        turn.apply(ServerEvent::ContentParts(vec![
            code_part("plt.plot([1, 2])"),
            inline_part("image/png", "cGxvdA=="),
        ]));
        assert_eq!(turn.code_execution().image.as_deref(), Some("cGxvdA=="));
    }

    #[test]
    fn test_grounding_bundles_turn_response() {
        let mut turn = Turn::new();
        turn.apply(ServerEvent::Transcription {
            speaker: Speaker::Ai,
            text: "It is ".to_string(),
            finished: false,
        });
        turn.apply(ServerEvent::Transcription {
            speaker: Speaker::Ai,
            text: "sunny.".to_string(),
            finished: false,
        });
        turn.apply(ServerEvent::Transcription {
            speaker: Speaker::User,
            text: "thanks".to_string(),
            finished: false,
        });

        let Value::Object(grounding) = json!({"webSearchQueries": ["weather"]}) else {
            unreachable!()
        };
        let signals = turn.apply(ServerEvent::Grounding(grounding.clone()));

        assert_eq!(
            signals,
            vec![Signal::ToolCall(ToolCallUpdate {
                tool_name: ToolName::GoogleSearch,
                result: ToolResult::Search {
                    ai_response: "It is sunny.".to_string(),
                    grounding,
                },
            })]
        );
        assert!(turn.search_active());
    }

    #[test]
    fn test_only_first_audio_part_is_played() {
        let mut turn = Turn::new();
        let first = pcm::encode_bytes(&[1, 0, 2, 0]);
        let second = pcm::encode_bytes(&[9, 9]);

        let signals = turn.apply(ServerEvent::ContentParts(vec![
            inline_part("audio/pcm;rate=24000", &first),
            inline_part("audio/pcm;rate=24000", &second),
        ]));

        assert_eq!(signals, vec![Signal::PlayAudio(vec![1, 0, 2, 0])]);
    }

    #[test]
    fn test_undecodable_audio_becomes_empty() {
        let mut turn = Turn::new();
        let signals = turn.apply(ServerEvent::ContentParts(vec![inline_part(
            "audio/pcm",
            "***",
        )]));
        assert_eq!(signals, vec![Signal::PlayAudio(Vec::new())]);
    }

    #[test]
    fn test_interrupted_and_transcription_signals() {
        let mut turn = Turn::new();
        assert_eq!(turn.apply(ServerEvent::Interrupted), vec![Signal::Interrupt]);

        let signals = turn.apply(ServerEvent::Transcription {
            speaker: Speaker::User,
            text: "hi".to_string(),
            finished: true,
        });
        assert_eq!(
            signals,
            vec![Signal::Transcription(TranscriptionUpdate {
                text: "hi".to_string(),
                is_final: true,
                speaker: Speaker::User,
            })]
        );
        assert_eq!(turn.ai_response(), "");
    }
}
