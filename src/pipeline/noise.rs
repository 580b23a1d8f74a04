//! Stationary noise suppression
//!
//! Spectral subtraction over a continuously adapted noise profile. Each
//! frame is windowed, transformed, attenuated in the magnitude domain and
//! transformed back. The suppression mode sets the subtraction depth and
//! the spectral floor.

use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};

/// Suppression depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseMode {
    Off,
    Gentle,
    Moderate,
    Aggressive,
}

impl NoiseMode {
    /// (over-subtraction factor, spectral floor)
    fn parameters(&self) -> (f32, f32) {
        match self {
            NoiseMode::Off => (0.0, 1.0),
            NoiseMode::Gentle => (1.0, 0.30),
            NoiseMode::Moderate => (1.6, 0.15),
            NoiseMode::Aggressive => (2.5, 0.05),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" => Some(NoiseMode::Off),
            "gentle" => Some(NoiseMode::Gentle),
            "moderate" => Some(NoiseMode::Moderate),
            "aggressive" => Some(NoiseMode::Aggressive),
            _ => None,
        }
    }
}

impl Default for NoiseMode {
    fn default() -> Self {
        NoiseMode::Moderate
    }
}

/// Frame-by-frame spectral subtraction
pub struct NoiseSuppressor {
    mode: NoiseMode,
    frame_len: usize,
    /// Running magnitude-spectrum estimate of the noise
    noise_profile: Vec<f32>,
    profile_frames: u32,
    /// Profile adaptation rate once warmed up
    adaptation: f32,
    planner: FftPlanner<f32>,
    window: Vec<f32>,
}

impl NoiseSuppressor {
    /// Frames of initial audio treated as the noise-profile warmup
    const WARMUP_FRAMES: u32 = 10;

    pub fn new(mode: NoiseMode, frame_len: usize) -> Self {
        let window = (0..frame_len)
            .map(|i| {
                let x = std::f32::consts::PI * 2.0 * i as f32 / frame_len as f32;
                0.5 - 0.5 * x.cos()
            })
            .collect();
        Self {
            mode,
            frame_len,
            noise_profile: vec![0.0; frame_len],
            profile_frames: 0,
            adaptation: 0.02,
            planner: FftPlanner::new(),
            window,
        }
    }

    pub fn mode(&self) -> NoiseMode {
        self.mode
    }

    /// Suppress stationary noise in one frame. `is_speech` steers profile
    /// adaptation: only non-speech frames update the noise estimate.
    pub fn process(&mut self, samples: &[i16], is_speech: bool) -> Vec<i16> {
        if self.mode == NoiseMode::Off || samples.len() != self.frame_len {
            return samples.to_vec();
        }

        let fft = self.planner.plan_fft_forward(self.frame_len);
        let ifft = self.planner.plan_fft_inverse(self.frame_len);

        let mut spectrum: Vec<Complex<f32>> = samples
            .iter()
            .zip(self.window.iter())
            .map(|(&s, &w)| Complex::new(s as f32 * w, 0.0))
            .collect();
        fft.process(&mut spectrum);

        // Update the noise profile from quiet frames
        if !is_speech || self.profile_frames < Self::WARMUP_FRAMES {
            let rate = if self.profile_frames < Self::WARMUP_FRAMES {
                1.0 / (self.profile_frames + 1) as f32
            } else {
                self.adaptation
            };
            for (profile, bin) in self.noise_profile.iter_mut().zip(spectrum.iter()) {
                *profile = *profile * (1.0 - rate) + bin.norm() * rate;
            }
            self.profile_frames += 1;
        }

        let (alpha, floor) = self.mode.parameters();
        for (bin, &noise) in spectrum.iter_mut().zip(self.noise_profile.iter()) {
            let magnitude = bin.norm();
            if magnitude <= 0.0 {
                continue;
            }
            let cleaned = (magnitude - alpha * noise).max(floor * magnitude);
            let gain = cleaned / magnitude;
            *bin *= gain;
        }

        ifft.process(&mut spectrum);

        // Invert the analysis window where it is meaningful; the frame edges
        // (where a Hann window vanishes) fall back to the raw samples.
        let scale = 1.0 / self.frame_len as f32;
        spectrum
            .iter()
            .zip(self.window.iter())
            .zip(samples.iter())
            .map(|((bin, &w), &raw)| {
                if w > 0.1 {
                    (bin.re * scale / w).clamp(i16::MIN as f32, i16::MAX as f32) as i16
                } else {
                    raw
                }
            })
            .collect()
    }

    pub fn reset(&mut self) {
        self.noise_profile.iter_mut().for_each(|p| *p = 0.0);
        self.profile_frames = 0;
    }
}
