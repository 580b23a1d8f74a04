//! Utterance construction
//!
//! Turns per-frame VAD decisions into VAD-delimited utterances using
//! hysteresis: `k_in` consecutive speech frames open an utterance, `k_out`
//! consecutive non-speech frames close it. Duration and memory bounds are
//! enforced; overflow force-closes the utterance with `forced = true`.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::frame::AudioFrame;
use super::vad::VadDecision;
use crate::types::{CallId, Utterance};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UtteranceConfig {
    /// Consecutive speech frames required to open an utterance
    pub k_in: u32,
    /// Consecutive non-speech frames required to close it
    pub k_out: u32,
    /// Utterances shorter than this are dropped
    pub min_utterance_ms: u64,
    /// Utterances longer than this are force-closed
    pub max_utterance_ms: u64,
    /// Hard cap on buffered audio per call
    pub max_memory_bytes: usize,
}

impl Default for UtteranceConfig {
    fn default() -> Self {
        Self {
            k_in: 3,
            k_out: 15,
            min_utterance_ms: 200,
            max_utterance_ms: 15_000,
            max_memory_bytes: 1024 * 1024,
        }
    }
}

struct BufferedFrame {
    frame: AudioFrame,
    is_speech: bool,
    confidence: f32,
}

/// Why an utterance closed; carried to the emitted record as `forced`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    SilenceRun,
    Flush,
    MaxDuration,
    MemoryOverflow,
}

/// Builds utterances from a classified frame stream for one call
pub struct UtteranceBuilder {
    call_id: CallId,
    config: UtteranceConfig,
    /// Speech candidates seen while idle, waiting for k_in
    onset: Vec<BufferedFrame>,
    /// Frames of the currently open utterance
    open: Vec<BufferedFrame>,
    consecutive_silence: u32,
    utterances_emitted: u64,
    utterances_dropped: u64,
}

impl UtteranceBuilder {
    pub fn new(call_id: CallId, config: UtteranceConfig) -> Self {
        Self {
            call_id,
            config,
            onset: Vec::new(),
            open: Vec::new(),
            consecutive_silence: 0,
            utterances_emitted: 0,
            utterances_dropped: 0,
        }
    }

    /// Whether an utterance is currently open
    pub fn is_open(&self) -> bool {
        !self.open.is_empty()
    }

    pub fn emitted(&self) -> u64 {
        self.utterances_emitted
    }

    /// Feed one classified frame. Returns a finished utterance when one
    /// closes.
    pub fn push(&mut self, frame: AudioFrame, decision: VadDecision) -> Option<Utterance> {
        let buffered = BufferedFrame {
            frame,
            is_speech: decision.is_speech,
            confidence: decision.confidence,
        };

        if self.open.is_empty() {
            // Idle: collect onset candidates
            if buffered.is_speech {
                self.onset.push(buffered);
                if self.onset.len() as u32 >= self.config.k_in {
                    self.open = std::mem::take(&mut self.onset);
                    self.consecutive_silence = 0;
                    debug!(call_id = %self.call_id, "utterance opened");
                }
            } else {
                self.onset.clear();
            }
            return None;
        }

        // Open: every frame belongs to the contiguous run
        if buffered.is_speech {
            self.consecutive_silence = 0;
        } else {
            self.consecutive_silence += 1;
        }
        self.open.push(buffered);

        if self.consecutive_silence >= self.config.k_out {
            return self.close(CloseReason::SilenceRun);
        }
        if self.open_duration_ms() >= self.config.max_utterance_ms {
            return self.close(CloseReason::MaxDuration);
        }
        if self.open_bytes() >= self.config.max_memory_bytes {
            warn!(call_id = %self.call_id, "utterance memory cap reached, force closing");
            return self.close(CloseReason::MemoryOverflow);
        }
        None
    }

    /// Close any open utterance (silence-timeout flush from the pipeline
    /// owner when frames stop arriving).
    pub fn flush(&mut self) -> Option<Utterance> {
        if self.open.is_empty() {
            self.onset.clear();
            return None;
        }
        self.close(CloseReason::Flush)
    }

    fn open_duration_ms(&self) -> u64 {
        self.open.iter().map(|b| b.frame.duration_ms as u64).sum()
    }

    fn open_bytes(&self) -> usize {
        self.open.iter().map(|b| b.frame.samples.len() * 2).sum()
    }

    fn close(&mut self, reason: CloseReason) -> Option<Utterance> {
        let mut frames = std::mem::take(&mut self.open);
        self.consecutive_silence = 0;

        // Trim the trailing silence run; the utterance ends at its last
        // speech frame.
        while frames.last().map(|b| !b.is_speech).unwrap_or(false) {
            frames.pop();
        }
        if frames.is_empty() {
            return None;
        }

        let duration_ms: u64 = frames.iter().map(|b| b.frame.duration_ms as u64).sum();
        if duration_ms < self.config.min_utterance_ms {
            self.utterances_dropped += 1;
            debug!(
                call_id = %self.call_id,
                duration_ms, "utterance below minimum duration, dropped"
            );
            return None;
        }

        let sample_rate = frames[0].frame.sample_rate;
        let started_at = frames[0].frame.timestamp;
        let speech_frames: Vec<&BufferedFrame> = frames.iter().filter(|b| b.is_speech).collect();
        let confidence = if speech_frames.is_empty() {
            0.0
        } else {
            speech_frames.iter().map(|b| b.confidence).sum::<f32>() / speech_frames.len() as f32
        };

        let mut audio = Vec::with_capacity(frames.len() * frames[0].frame.samples.len() * 2);
        for b in &frames {
            for s in &b.frame.samples {
                audio.extend_from_slice(&s.to_le_bytes());
            }
        }

        let forced = matches!(
            reason,
            CloseReason::MaxDuration | CloseReason::MemoryOverflow
        );

        self.utterances_emitted += 1;
        debug!(
            call_id = %self.call_id,
            duration_ms,
            confidence,
            ?reason,
            "utterance closed"
        );

        Some(Utterance {
            call_id: self.call_id.clone(),
            started_at,
            duration_ms,
            audio,
            sample_rate,
            confidence,
            forced,
        })
    }
}
