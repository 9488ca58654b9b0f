//! Audio frame decoder
//!
//! Rebuilds playable buffers from raw 16-bit PCM chunks as they arrive from
//! the network. Chunks may be any length; whatever does not form a whole
//! frame is dropped.

use crate::pcm::{BYTES_PER_SAMPLE, PCM16_DECODE_SCALE};

/// A block of planar, normalized float samples at a fixed rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Zero-length buffer with the given layout.
    pub fn empty(sample_rate: u32, channel_count: u16) -> Self {
        Self {
            sample_rate,
            channels: vec![Vec::new(); channel_count as usize],
        }
    }

    /// Mono buffer from a slice of samples.
    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            channels: vec![samples],
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> u16 {
        self.channels.len() as u16
    }

    /// Number of frames (samples per channel).
    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.len() as f64 / f64::from(self.sample_rate)
    }

    /// Samples of one channel, or an empty slice if the channel does not exist.
    pub fn channel(&self, index: usize) -> &[f32] {
        self.channels.get(index).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Decode interleaved 16-bit little-endian PCM into a planar buffer.
///
/// Trailing bytes that do not make up a whole sample, and trailing samples
/// that do not make up a whole frame, are dropped. Inputs shorter than one
/// frame produce an empty buffer rather than an error.
pub fn decode(raw: &[u8], sample_rate: u32, channel_count: u16) -> AudioBuffer {
    let channel_count_usize = channel_count as usize;
    if channel_count_usize == 0 {
        return AudioBuffer::empty(sample_rate, 0);
    }

    let sample_count = raw.len() / BYTES_PER_SAMPLE;
    let frame_count = sample_count / channel_count_usize;
    if frame_count == 0 {
        return AudioBuffer::empty(sample_rate, channel_count);
    }

    let mut channels = vec![Vec::with_capacity(frame_count); channel_count_usize];
    for frame in 0..frame_count {
        for (channel, data) in channels.iter_mut().enumerate() {
            let offset = (frame * channel_count_usize + channel) * BYTES_PER_SAMPLE;
            let value = i16::from_le_bytes([raw[offset], raw[offset + 1]]);
            data.push(f32::from(value) / PCM16_DECODE_SCALE);
        }
    }

    AudioBuffer {
        sample_rate,
        channels,
    }
}
