//! Acoustic echo cancellation
//!
//! NLMS adaptive filter working frame-by-frame against a bounded history of
//! egress (far-end) audio. The reference ring holds at most `reference_ms`
//! of samples, which also bounds the filter length.

use std::collections::VecDeque;

/// NLMS echo canceller
pub struct EchoCanceller {
    /// Adaptive filter taps, most recent reference sample first
    weights: Vec<f32>,
    /// Far-end reference history, newest at the back
    reference: VecDeque<f32>,
    step_size: f32,
    enabled: bool,
}

impl EchoCanceller {
    /// `reference_ms` caps both the reference history and the echo path the
    /// filter can model (spec bound: 200 ms).
    pub fn new(sample_rate: u32, reference_ms: u32) -> Self {
        let taps = (sample_rate as usize / 1000) * reference_ms.min(200) as usize;
        Self {
            weights: vec![0.0; taps],
            reference: VecDeque::with_capacity(taps),
            step_size: 0.5,
            enabled: taps > 0,
        }
    }

    /// Feed far-end audio that is being played to the caller
    pub fn push_reference(&mut self, samples: &[i16]) {
        if !self.enabled {
            return;
        }
        for &s in samples {
            if self.reference.len() == self.weights.len() {
                self.reference.pop_front();
            }
            self.reference.push_back(s as f32 / 32768.0);
        }
    }

    /// Cancel correlated far-end content from one near-end frame.
    ///
    /// The caller pushes the matching span of egress audio via
    /// `push_reference` before handing in the near-end frame, so the tail of
    /// the reference ring is time-aligned with this frame.
    pub fn process(&mut self, samples: &[i16]) -> Vec<i16> {
        if !self.enabled || self.reference.is_empty() {
            return samples.to_vec();
        }

        // Work on a contiguous snapshot of the reference ring, newest last
        let reference: Vec<f32> = self.reference.iter().copied().collect();

        let mut out = Vec::with_capacity(samples.len());
        for (n, &near) in samples.iter().enumerate() {
            let desired = near as f32 / 32768.0;

            // Snapshot index of the reference sample aligned with this near
            // sample; tap k looks k samples further into the past.
            let base = reference.len() as isize - samples.len() as isize + n as isize;

            let mut estimate = 0.0f32;
            let mut norm = 1e-6f32;
            for (k, &w) in self.weights.iter().enumerate() {
                let idx = base - k as isize;
                if idx < 0 {
                    break;
                }
                let x = reference[idx as usize];
                estimate += w * x;
                norm += x * x;
            }

            let error = desired - estimate;

            // NLMS weight update
            let mu = self.step_size * error / norm;
            for (k, w) in self.weights.iter_mut().enumerate() {
                let idx = base - k as isize;
                if idx < 0 {
                    break;
                }
                *w += mu * reference[idx as usize];
            }

            out.push((error.clamp(-1.0, 1.0) * 32767.0) as i16);
        }
        out
    }

    pub fn reset(&mut self) {
        self.weights.iter_mut().for_each(|w| *w = 0.0);
        self.reference.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo_noise(len: usize, seed: u64, amplitude: f32) -> Vec<i16> {
        let mut state = seed.max(1);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let unit = (state as f64 / u64::MAX as f64) as f32 * 2.0 - 1.0;
                (unit * amplitude * 32767.0) as i16
            })
            .collect()
    }

    fn energy(samples: &[i16]) -> f64 {
        samples.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / samples.len() as f64
    }

    #[test]
    fn test_steady_state_echo_reduction() {
        // Far-end noise played to the caller comes back delayed and
        // attenuated; the canceller must reach at least 10 dB reduction.
        let sample_rate = 8000;
        let mut canceller = EchoCanceller::new(sample_rate, 100);

        let delay_samples = 160; // 20 ms echo path
        let attenuation = 0.5f64;
        let total = sample_rate as usize * 2; // 2 s
        let far = pseudo_noise(total, 1234, 0.4);

        let frame_len = 160;
        let mut input_energy_tail = 0.0f64;
        let mut output_energy_tail = 0.0f64;
        let mut tail_frames = 0usize;
        let n_frames = total / frame_len;

        for f in 0..n_frames {
            let start = f * frame_len;
            let far_frame = &far[start..start + frame_len];
            canceller.push_reference(far_frame);

            // Simulated near-end frame: pure echo of the far end
            let near: Vec<i16> = (0..frame_len)
                .map(|i| {
                    let n = start + i;
                    if n >= delay_samples {
                        (far[n - delay_samples] as f64 * attenuation) as i16
                    } else {
                        0
                    }
                })
                .collect();

            let cleaned = canceller.process(&near);

            // Judge only the steady state (final quarter)
            if f >= n_frames * 3 / 4 {
                input_energy_tail += energy(&near);
                output_energy_tail += energy(&cleaned);
                tail_frames += 1;
            }
        }

        assert!(tail_frames > 0);
        let reduction_db = 10.0 * (input_energy_tail / output_energy_tail.max(1e-12)).log10();
        assert!(
            reduction_db >= 10.0,
            "steady-state echo reduction {reduction_db:.1} dB below 10 dB"
        );
    }

    #[test]
    fn test_no_reference_is_passthrough() {
        let mut canceller = EchoCanceller::new(8000, 100);
        let near = pseudo_noise(160, 9, 0.3);
        assert_eq!(canceller.process(&near), near);
    }

    #[test]
    fn test_reference_history_bounded() {
        let mut canceller = EchoCanceller::new(8000, 200);
        let taps = canceller.weights.len();
        assert_eq!(taps, 1600); // 200 ms at 8 kHz
        canceller.push_reference(&pseudo_noise(5000, 3, 0.2));
        assert_eq!(canceller.reference.len(), taps);
    }

    #[test]
    fn test_reference_cap_at_200ms() {
        let canceller = EchoCanceller::new(8000, 500);
        assert_eq!(canceller.weights.len(), 1600);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut canceller = EchoCanceller::new(8000, 100);
        canceller.push_reference(&pseudo_noise(800, 3, 0.2));
        canceller.process(&pseudo_noise(160, 4, 0.2));
        canceller.reset();
        assert!(canceller.reference.is_empty());
        assert!(canceller.weights.iter().all(|&w| w == 0.0));
    }
}
