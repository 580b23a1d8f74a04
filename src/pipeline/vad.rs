//! Voice activity detection
//!
//! Energy-based frame classifier combining an adaptive noise floor with an
//! absolute energy gate: a frame is speech when it clears the floor by the
//! configured margin AND carries enough absolute energy. The gate keeps
//! low-level line noise below speech from a cold start, before the floor
//! has adapted. Each frame gets a boolean decision plus a confidence
//! derived from its SNR; utterance-level hysteresis (k_in / k_out) lives in
//! the utterance builder, not here.

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::frame::AudioFrame;

/// VAD tuning
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VadConfig {
    /// Energy must exceed the noise floor by this many dB to count as speech
    pub threshold_db: f32,
    /// Absolute gate in dBFS; frames below it are never speech
    pub min_energy_db: f32,
    /// Upward noise-floor adaptation rate on quiet frames (0..1)
    pub adaptation_rate: f32,
    /// Whether the noise floor adapts at all
    pub adaptive_noise_floor: bool,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold_db: 12.0,
            min_energy_db: -45.0,
            adaptation_rate: 0.05,
            adaptive_noise_floor: true,
        }
    }
}

/// Per-frame classification result
#[derive(Debug, Clone, Copy)]
pub struct VadDecision {
    pub is_speech: bool,
    /// 0..1, scaled from the frame's SNR over the decision threshold
    pub confidence: f32,
    pub energy_db: f32,
}

/// Energy VAD with adaptive noise floor
pub struct Vad {
    config: VadConfig,
    noise_floor: f32,
    frames_seen: u64,
}

impl Vad {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            // Optimistically quiet; the floor rises toward real line noise
            noise_floor: 1e-6,
            frames_seen: 0,
        }
    }

    /// Classify one frame, updating the noise floor estimate.
    ///
    /// The floor tracks quiet frames: it drops immediately to a quieter
    /// frame and rises slowly, so a burst of speech cannot drag it up.
    pub fn classify(&mut self, frame: &AudioFrame) -> VadDecision {
        let energy = frame.energy().max(1e-9);
        let energy_db = 20.0 * energy.log10();
        let floor_db = 20.0 * self.noise_floor.max(1e-9).log10();
        let snr_db = energy_db - floor_db;

        let is_speech =
            snr_db > self.config.threshold_db && energy_db > self.config.min_energy_db;

        if self.config.adaptive_noise_floor && !is_speech {
            if energy < self.noise_floor {
                self.noise_floor = energy;
            } else {
                self.noise_floor = self.noise_floor * (1.0 - self.config.adaptation_rate)
                    + energy * self.config.adaptation_rate;
            }
        }

        // Confidence saturates at twice the threshold
        let confidence = if is_speech {
            (snr_db / (2.0 * self.config.threshold_db)).clamp(0.0, 1.0)
        } else {
            0.0
        };

        self.frames_seen += 1;
        trace!(
            frame = self.frames_seen,
            energy_db,
            snr_db,
            is_speech,
            "vad frame"
        );

        VadDecision {
            is_speech,
            confidence,
            energy_db,
        }
    }

    /// Current noise floor in dB
    pub fn noise_floor_db(&self) -> f32 {
        20.0 * self.noise_floor.max(1e-9).log10()
    }

    pub fn reset(&mut self) {
        self.noise_floor = 1e-6;
        self.frames_seen = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::frame::{Framer, SourceTag};

    fn frame(level: i16) -> AudioFrame {
        let mut framer = Framer::new(8000, 20, SourceTag::Ingress);
        framer.push(&vec![level; 160]).remove(0)
    }

    #[test]
    fn test_silence_is_not_speech() {
        let mut vad = Vad::new(VadConfig::default());
        for _ in 0..10 {
            let d = vad.classify(&frame(0));
            assert!(!d.is_speech);
        }
    }

    #[test]
    fn test_speech_detected_from_cold_start() {
        // A call that opens with the caller already talking
        let mut vad = Vad::new(VadConfig::default());
        let d = vad.classify(&frame(12000));
        assert!(d.is_speech);
        assert!(d.confidence > 0.5);
    }

    #[test]
    fn test_background_noise_below_gate_is_not_speech() {
        // Low-level line noise clears the adaptive floor but not the gate
        let mut vad = Vad::new(VadConfig::default());
        for _ in 0..20 {
            let d = vad.classify(&frame(100)); // ~ -50 dBFS
            assert!(!d.is_speech);
        }
    }

    #[test]
    fn test_loud_frame_after_noise_is_speech() {
        let mut vad = Vad::new(VadConfig::default());
        for _ in 0..10 {
            assert!(!vad.classify(&frame(100)).is_speech);
        }
        let d = vad.classify(&frame(12000));
        assert!(d.is_speech);
    }

    #[test]
    fn test_floor_tracks_down_fast() {
        let mut vad = Vad::new(VadConfig::default());
        // Sub-gate noise raises the floor over time
        for _ in 0..20 {
            vad.classify(&frame(100));
        }
        let floor_after_noise = vad.noise_floor_db();
        // One near-silent frame pulls it straight back down
        vad.classify(&frame(2));
        assert!(vad.noise_floor_db() < floor_after_noise);
    }

    #[test]
    fn test_speech_does_not_raise_floor() {
        let mut vad = Vad::new(VadConfig::default());
        vad.classify(&frame(20));
        let floor_before = vad.noise_floor_db();
        for _ in 0..50 {
            let d = vad.classify(&frame(12000));
            assert!(d.is_speech);
        }
        assert!((vad.noise_floor_db() - floor_before).abs() < 1.0);
    }

    #[test]
    fn test_confidence_bounded() {
        let mut vad = Vad::new(VadConfig::default());
        vad.classify(&frame(10));
        let d = vad.classify(&frame(i16::MAX));
        assert!(d.confidence <= 1.0);
        assert!(d.is_speech);
    }
}
