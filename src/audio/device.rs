//! Device abstractions used by the session
//!
//! The session only talks to audio hardware through these traits so that the
//! PulseAudio backend can be swapped for in-memory fakes.

use super::decoder::AudioBuffer;
use tokio::sync::mpsc;

/// Identifier of one scheduled buffer on an output context.
pub type VoiceId = u64;

/// Errors raised while acquiring audio devices
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Microphone missing, busy or access denied
    #[error("microphone unavailable: {0}")]
    Input(String),

    /// Output device missing or refused the stream
    #[error("audio output unavailable: {0}")]
    Output(String),

    /// The device worker thread went away before reporting back
    #[error("audio worker failed: {0}")]
    Worker(String),
}

/// Parameters for opening the microphone.
#[derive(Debug, Clone)]
pub struct InputRequest {
    pub sample_rate: u32,
    pub block_size: usize,
    /// PulseAudio source name; `None` for the default source.
    pub device: Option<String>,
}

/// Control side of a live microphone.
pub trait MicrophoneTrack: Send {
    /// Start delivering blocks. Blocks captured before this are discarded.
    fn resume(&mut self);

    /// Stop the device. Must be idempotent.
    fn stop(&mut self);
}

/// A live microphone: blocks of float samples plus the track controlling them.
pub struct MicrophoneStream {
    frames: mpsc::Receiver<Vec<f32>>,
    track: Box<dyn MicrophoneTrack>,
}

impl MicrophoneStream {
    pub fn new(frames: mpsc::Receiver<Vec<f32>>, track: Box<dyn MicrophoneTrack>) -> Self {
        Self { frames, track }
    }

    /// Next captured chunk, or `None` once the device has stopped.
    pub async fn next_chunk(&mut self) -> Option<Vec<f32>> {
        self.frames.recv().await
    }

    pub fn resume(&mut self) {
        self.track.resume();
    }

    pub fn stop(&mut self) {
        self.track.stop();
        self.frames.close();
    }
}

/// An output device with its own clock, onto which buffers are scheduled.
///
/// Times are seconds on the context's clock.
pub trait OutputContext: Send {
    fn sample_rate(&self) -> u32;

    /// Current reading of the output clock.
    fn current_time(&self) -> f64;

    /// Play `buffer` starting at `when`.
    fn start(&mut self, id: VoiceId, buffer: AudioBuffer, when: f64);

    /// Cut a scheduled or playing buffer. Unknown ids are ignored.
    fn stop(&mut self, id: VoiceId);

    /// Ids of buffers that reached their natural end since the last call.
    fn drain_finished(&mut self) -> Vec<VoiceId>;

    /// Linear gain applied to everything rendered.
    fn set_gain(&mut self, gain: f32);

    fn is_running(&self) -> bool;

    /// Release the device. Must be idempotent.
    fn close(&mut self);
}

/// Factory for microphone and output devices.
pub trait AudioBackend: Send + Sync {
    fn open_microphone(&self, request: &InputRequest) -> Result<MicrophoneStream, DeviceError>;

    fn open_output(
        &self,
        sample_rate: u32,
        channel_count: u16,
    ) -> Result<Box<dyn OutputContext>, DeviceError>;
}
