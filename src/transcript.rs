//! Transcript assembly
//!
//! Turns the stream of transcription fragments into finalized, immutable
//! transcript entries plus an in-progress pair (one per speaker).
//!
//! Boundaries:
//! - a fragment marked final flushes that speaker's pending text;
//! - a turnover away from the user flushes pending user text;
//! - pending assistant text is flushed when the assistant finalizes, when the
//!   turn completes, or when the session ends. Assistant transcription lags
//!   its audio and interleaves with user input, so a user fragment does not
//!   end the assistant's sentence.

use crate::events::{Speaker, TranscriptionUpdate};
use chrono::Utc;
use serde::Serialize;

/// Finalized speech. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    /// `<unix-millis>-<seq>-<speaker>`
    pub id: String,
    /// Creation order within the assembler.
    pub seq: u64,
    pub speaker: Speaker,
    pub text: String,
}

/// Text accumulated but not yet finalized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InProgressTranscript {
    pub user: String,
    pub ai: String,
}

#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    pending: InProgressTranscript,
    last_speaker: Option<Speaker>,
    next_seq: u64,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one fragment and return the entries it finalized, in order.
    pub fn on_update(&mut self, update: &TranscriptionUpdate) -> Vec<TranscriptEntry> {
        let mut finalized = Vec::new();

        if self.last_speaker == Some(Speaker::User) && update.speaker != Speaker::User {
            finalized.extend(self.flush_speaker(Speaker::User));
        }
        self.last_speaker = Some(update.speaker);

        self.pending_mut(update.speaker).push_str(&update.text);
        if update.is_final {
            finalized.extend(self.flush_speaker(update.speaker));
        }

        finalized
    }

    /// The turn is over: the assistant has finished speaking.
    pub fn finish_turn(&mut self) -> Option<TranscriptEntry> {
        self.flush_speaker(Speaker::Ai)
    }

    /// Flush everything pending, user first, and forget the last speaker.
    pub fn flush(&mut self) -> Vec<TranscriptEntry> {
        let mut finalized = Vec::new();
        finalized.extend(self.flush_speaker(Speaker::User));
        finalized.extend(self.flush_speaker(Speaker::Ai));
        self.last_speaker = None;
        finalized
    }

    pub fn in_progress(&self) -> InProgressTranscript {
        self.pending.clone()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.user.is_empty() || !self.pending.ai.is_empty()
    }

    fn pending_mut(&mut self, speaker: Speaker) -> &mut String {
        match speaker {
            Speaker::User => &mut self.pending.user,
            Speaker::Ai => &mut self.pending.ai,
        }
    }

    fn flush_speaker(&mut self, speaker: Speaker) -> Option<TranscriptEntry> {
        let text = std::mem::take(self.pending_mut(speaker));
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        Some(TranscriptEntry {
            id: format!("{}-{}-{}", Utc::now().timestamp_millis(), seq, speaker),
            seq,
            speaker,
            text: text.to_string(),
        })
    }
}
