//! Playback scheduler
//!
//! Buffers arrive from the network at irregular intervals and are laid end to
//! end on the output clock. A cursor tracks where the next buffer starts; it
//! never points into the past, so a producer that falls behind resumes at the
//! current clock time instead of scheduling audio that would be skipped.

use super::decoder::AudioBuffer;
use super::device::{OutputContext, VoiceId};
use std::collections::HashSet;
use tracing::{debug, info};

pub struct PlaybackScheduler {
    output: Box<dyn OutputContext>,
    next_start_time: f64,
    live: HashSet<VoiceId>,
    next_id: VoiceId,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn OutputContext>) -> Self {
        let next_start_time = output.current_time();
        Self {
            output,
            next_start_time,
            live: HashSet::new(),
            next_id: 0,
        }
    }

    /// Queue a buffer directly after everything already scheduled.
    ///
    /// Returns the start time, or `None` for an empty buffer (a no-op).
    pub fn schedule(&mut self, buffer: AudioBuffer) -> Option<f64> {
        self.reap();

        if buffer.is_empty() {
            debug!("Skipping empty audio buffer");
            return None;
        }

        let start = self.next_start_time.max(self.output.current_time());
        let duration = buffer.duration();
        let id = self.next_id;
        self.next_id += 1;

        self.output.start(id, buffer, start);
        self.live.insert(id);
        self.next_start_time = start + duration;

        debug!(
            "🔊 Scheduled buffer {} at {:.3}s for {:.3}s ({} live)",
            id,
            start,
            duration,
            self.live.len()
        );
        Some(start)
    }

    /// Barge-in: cut everything and let the next buffer start immediately.
    pub fn interrupt(&mut self) {
        let cut = self.stop_all();
        self.next_start_time = 0.0;
        info!("✋ Playback interrupted ({} buffers cut)", cut);
    }

    /// Stop every live buffer. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        let cut = self.stop_all();
        if cut > 0 {
            debug!("Stopped {} buffers on shutdown", cut);
        }
    }

    /// Close the output device if it is still running.
    pub fn close_output(&mut self) {
        if self.output.is_running() {
            self.output.close();
        }
    }

    /// `false` once the device has closed or failed.
    pub fn is_output_running(&self) -> bool {
        self.output.is_running()
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.output.set_gain(gain);
    }

    /// Forget buffers that finished on their own.
    pub fn reap(&mut self) {
        for id in self.output.drain_finished() {
            self.live.remove(&id);
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    fn stop_all(&mut self) -> usize {
        self.reap();
        let count = self.live.len();
        for id in self.live.drain() {
            self.output.stop(id);
        }
        count
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.shutdown();
        self.close_output();
    }
}
