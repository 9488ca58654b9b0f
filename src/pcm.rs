//! PCM codec
//!
//! Conversions between normalized float samples, 16-bit little-endian PCM
//! and the base64 text encoding the Live API uses for media payloads.

use base64::engine::general_purpose;
use base64::Engine;

/// Scale applied when converting floats to 16-bit PCM.
pub const PCM16_ENCODE_SCALE: f32 = 32767.0;

/// Divisor applied when converting 16-bit PCM back to floats.
///
/// This is intentionally not equal to [`PCM16_ENCODE_SCALE`]: the remote
/// protocol has always been fed samples scaled by 32767 and read back with
/// 32768, and changing either side breaks bit-compatibility.
pub const PCM16_DECODE_SCALE: f32 = 32768.0;

/// Width of one 16-bit sample in bytes.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Error returned when a base64 payload cannot be decoded
#[derive(Debug, thiserror::Error)]
#[error("invalid base64 payload: {0}")]
pub struct DecodeError(#[from] base64::DecodeError);

/// Encode arbitrary bytes as standard (padded) base64.
pub fn encode_bytes(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// Decode standard base64 text back into bytes.
pub fn decode_bytes(text: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(general_purpose::STANDARD.decode(text)?)
}

/// Convert a single normalized sample to a signed 16-bit value.
///
/// The sample is clamped to [-1, 1], scaled by 32767 and truncated toward zero.
pub fn sample_to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * PCM16_ENCODE_SCALE) as i16
}

/// Convert float samples to 16-bit little-endian PCM bytes.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        out.extend_from_slice(&sample_to_pcm16(sample).to_le_bytes());
    }
    out
}

/// Convert 16-bit little-endian PCM bytes to float samples.
///
/// A trailing odd byte is ignored.
pub fn pcm16_to_float(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|chunk| f32::from(i16::from_le_bytes([chunk[0], chunk[1]])) / PCM16_DECODE_SCALE)
        .collect()
}
