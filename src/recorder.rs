//! Session recorder for debugging - saves both audio directions as WAV
//!
//! `mic.wav` holds the exact PCM sent upstream, `assistant.wav` every buffer
//! handed to playback. A write failure disables the recorder; the session
//! itself is never affected.

use crate::audio::AudioBuffer;
use crate::capture::INPUT_SAMPLE_RATE;
use crate::pcm;
use chrono::Local;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

type Writer = WavWriter<BufWriter<File>>;

pub const MIC_FILE: &str = "mic.wav";
pub const ASSISTANT_FILE: &str = "assistant.wav";

pub struct SessionRecorder {
    dir: PathBuf,
    mic: Option<Writer>,
    assistant: Option<Writer>,
}

fn wav_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

impl SessionRecorder {
    /// Start a recording under `<base>/<YYYYmmdd_HHMMSS>/`.
    ///
    /// Returns `None` (after logging) if the files cannot be created.
    pub fn create(base: &Path, output_sample_rate: u32) -> Option<Self> {
        let dir = base.join(Local::now().format("%Y%m%d_%H%M%S").to_string());
        if let Err(e) = fs::create_dir_all(&dir) {
            error!("Failed to create recordings directory {:?}: {}", dir, e);
            return None;
        }

        let open = |name: &str, rate: u32| match WavWriter::create(dir.join(name), wav_spec(rate)) {
            Ok(writer) => Some(writer),
            Err(e) => {
                error!("Failed to create {}: {}", name, e);
                None
            }
        };

        let mic = open(MIC_FILE, INPUT_SAMPLE_RATE)?;
        let assistant = open(ASSISTANT_FILE, output_sample_rate)?;
        info!("⏺️ Recording session to {:?}", dir);

        Some(Self {
            dir,
            mic: Some(mic),
            assistant: Some(assistant),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_enabled(&self) -> bool {
        self.mic.is_some() && self.assistant.is_some()
    }

    /// Append 16-bit little-endian PCM sent to the server.
    pub fn write_mic(&mut self, pcm_bytes: &[u8]) {
        let Some(writer) = self.mic.as_mut() else {
            return;
        };
        let result = pcm_bytes
            .chunks_exact(pcm::BYTES_PER_SAMPLE)
            .try_for_each(|c| writer.write_sample(i16::from_le_bytes([c[0], c[1]])));
        if let Err(e) = result {
            self.disable(e);
        }
    }

    /// Append the first channel of a decoded assistant buffer.
    pub fn write_assistant(&mut self, buffer: &AudioBuffer) {
        let Some(writer) = self.assistant.as_mut() else {
            return;
        };
        let result = buffer
            .channel(0)
            .iter()
            .try_for_each(|&s| writer.write_sample(pcm::sample_to_pcm16(s)));
        if let Err(e) = result {
            self.disable(e);
        }
    }

    /// Flush headers and close both files.
    pub fn finish(mut self) {
        for writer in [self.mic.take(), self.assistant.take()].into_iter().flatten() {
            if let Err(e) = writer.finalize() {
                error!("Failed to finalize recording: {}", e);
            }
        }
        debug!("Recording closed: {:?}", self.dir);
    }

    fn disable(&mut self, e: hound::Error) {
        error!("Recording failed, disabling: {}", e);
        self.mic = None;
        self.assistant = None;
    }
}
