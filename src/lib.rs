//! Orbit - voice assistant client core for the Gemini Live API
//!
//! Streams microphone audio to a live model session, plays the spoken reply
//! back gaplessly, and turns the server's event stream into transcripts and
//! tool-call results for a UI.

#![forbid(unsafe_code)]

/// PCM sample conversion and base64 transport encoding
pub mod pcm;
/// Audio buffers, device access and playback scheduling
pub mod audio;
/// Microphone to session bridge
pub mod capture;
pub mod config;
pub mod credentials;
/// Server content classification and per-turn aggregation
pub mod demux;
pub mod events;
/// Live API wire types
pub mod gemini;
/// Live API WebSocket transport
pub mod gemini_client;
pub mod recorder;
pub mod session;
pub mod transcript;

#[cfg(test)]
mod testing;

pub use config::AssistantConfig;
pub use events::{SessionEvent, SessionState};
pub use session::{Session, SessionHandle};
