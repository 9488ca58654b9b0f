//! Capture pipeline
//!
//! Bridges the microphone to the outbound half of the session: blocks are
//! re-framed to a fixed size, converted to 16-bit PCM, base64 encoded and
//! queued on the live channel. Nothing here waits on the network.

use crate::audio::{AudioBackend, DeviceError, InputRequest, MicrophoneStream};
use crate::gemini::Blob;
use crate::gemini_client::LiveChannel;
use crate::pcm;
use tracing::{debug, info, warn};

pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Samples per outbound block.
pub const CAPTURE_BLOCK_SIZE: usize = 4096;

pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

pub struct CapturePipeline {
    stream: Option<MicrophoneStream>,
    pending: Vec<f32>,
    connected: bool,
}

impl CapturePipeline {
    /// Acquire the microphone. Blocks are not delivered until [`connect`](Self::connect).
    pub fn open(backend: &dyn AudioBackend, device: Option<String>) -> Result<Self, DeviceError> {
        let stream = backend.open_microphone(&InputRequest {
            sample_rate: INPUT_SAMPLE_RATE,
            block_size: CAPTURE_BLOCK_SIZE,
            device,
        })?;
        Ok(Self {
            stream: Some(stream),
            pending: Vec::with_capacity(CAPTURE_BLOCK_SIZE * 2),
            connected: false,
        })
    }

    /// Start delivering blocks.
    pub fn connect(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.resume();
            self.connected = true;
            info!("🎤 Microphone streaming");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Next full block.
    ///
    /// Never resolves while disconnected. Resolves to `None` if the device
    /// stops on its own. Cancel-safe: partial blocks are kept across calls.
    pub async fn next_block(&mut self) -> Option<Vec<f32>> {
        if !self.connected {
            return std::future::pending().await;
        }
        let Some(stream) = self.stream.as_mut() else {
            return std::future::pending().await;
        };

        loop {
            if self.pending.len() >= CAPTURE_BLOCK_SIZE {
                return Some(self.pending.drain(..CAPTURE_BLOCK_SIZE).collect());
            }
            let chunk = stream.next_chunk().await?;
            self.pending.extend_from_slice(&chunk);
        }
    }

    /// Stop delivering blocks and drop anything buffered.
    pub fn disconnect(&mut self) {
        if self.connected {
            debug!("Capture disconnected");
        }
        self.connected = false;
        self.pending.clear();
    }

    /// Release the microphone.
    pub fn stop_tracks(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            debug!("Microphone released");
        }
    }

    pub fn teardown(&mut self) {
        self.disconnect();
        self.stop_tracks();
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Encode PCM as an outbound audio blob.
pub fn encode_block(pcm_bytes: &[u8]) -> Blob {
    Blob {
        data: pcm::encode_bytes(pcm_bytes),
        mime_type: INPUT_MIME_TYPE.to_string(),
    }
}

/// Queue one block of PCM on the channel. Failures are logged, not returned.
pub fn forward(channel: &LiveChannel, pcm_bytes: &[u8]) {
    if let Err(e) = channel.send_audio(encode_block(pcm_bytes)) {
        warn!("Dropping microphone block: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_reframes_chunks_into_fixed_blocks() {
        let backend = FakeBackend::new();
        let mut capture = CapturePipeline::open(&backend, None).unwrap();
        capture.connect();
        assert!(backend.mic_resumed());

        let mic = backend.mic_sender().unwrap();
        mic.send(vec![0.5; 3000]).await.unwrap();
        mic.send(vec![-0.5; 3000]).await.unwrap();
        mic.send(vec![0.25; 2192]).await.unwrap();

        let first = capture.next_block().await.unwrap();
        assert_eq!(first.len(), CAPTURE_BLOCK_SIZE);
        assert_eq!(first[2999], 0.5);
        assert_eq!(first[3000], -0.5);

        let second = capture.next_block().await.unwrap();
        assert_eq!(second.len(), CAPTURE_BLOCK_SIZE);
        assert_eq!(second[0], -0.5);
        assert_eq!(second[CAPTURE_BLOCK_SIZE - 1], 0.25);
    }

    #[tokio::test]
    async fn test_no_blocks_before_connect() {
        let backend = FakeBackend::new();
        let mut capture = CapturePipeline::open(&backend, Some("alsa_input.usb".to_string())).unwrap();
        assert_eq!(backend.input_requests()[0].device.as_deref(), Some("alsa_input.usb"));
        assert_eq!(backend.input_requests()[0].sample_rate, INPUT_SAMPLE_RATE);

        backend.mic_sender().unwrap().send(vec![0.0; CAPTURE_BLOCK_SIZE]).await.unwrap();
        let result = timeout(Duration::from_millis(50), capture.next_block()).await;
        assert!(result.is_err());
        assert!(!backend.mic_resumed());
    }

    #[tokio::test]
    async fn test_device_end_yields_none() {
        let backend = FakeBackend::new();
        let mut capture = CapturePipeline::open(&backend, None).unwrap();
        capture.connect();

        backend.close_mic();
        assert!(capture.next_block().await.is_none());
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let backend = FakeBackend::new();
        let mut capture = CapturePipeline::open(&backend, None).unwrap();
        capture.connect();

        capture.teardown();
        capture.teardown();
        assert!(!capture.is_connected());
        assert_eq!(backend.mic_stops(), 1);

        drop(capture);
        assert_eq!(backend.mic_stops(), 1);
    }

    #[test]
    fn test_teardown_without_connect() {
        let backend = FakeBackend::new();
        let mut capture = CapturePipeline::open(&backend, None).unwrap();
        capture.teardown();
        assert_eq!(backend.mic_stops(), 1);
    }

    #[test]
    fn test_encode_block_tags_mime_type() {
        let blob = encode_block(&pcm::float_to_pcm16(&[0.0; 4]));
        assert_eq!(blob.mime_type, "audio/pcm;rate=16000");
        assert_eq!(pcm::decode_bytes(&blob.data).unwrap(), vec![0u8; 8]);
    }
}
