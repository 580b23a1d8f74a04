//! Band-limited sample-rate conversion
//!
//! The narrowband↔wideband pair (8 kHz ↔ 16 kHz) is converted with a
//! windowed-sinc half-band FIR, applied polyphase-style with group-delay
//! compensation. Arbitrary ratios go through rubato's sinc resampler.
//! Naive duplication/decimation is deliberately absent.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use thiserror::Error;

use super::codec::{samples_to_f32, samples_to_i16};

/// Filter length for the half-band FIR (odd, so the group delay is integral)
const HALFBAND_TAPS: usize = 63;

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("invalid sample rate {0}")]
    InvalidRate(u32),
    #[error("resampler failed: {0}")]
    Backend(String),
}

/// Resample linear PCM between two rates.
pub fn resample(samples: &[i16], from_hz: u32, to_hz: u32) -> Result<Vec<i16>, ResampleError> {
    if from_hz == 0 {
        return Err(ResampleError::InvalidRate(from_hz));
    }
    if to_hz == 0 {
        return Err(ResampleError::InvalidRate(to_hz));
    }
    if from_hz == to_hz || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    if to_hz == from_hz * 2 {
        Ok(upsample_2x(samples))
    } else if from_hz == to_hz * 2 {
        Ok(downsample_2x(samples))
    } else {
        resample_arbitrary(samples, from_hz, to_hz)
    }
}

/// Windowed-sinc lowpass; `cutoff` in cycles per sample, unity DC gain
fn design_lowpass(cutoff: f64, taps: usize) -> Vec<f64> {
    let center = (taps - 1) as f64 / 2.0;
    let mut h: Vec<f64> = (0..taps)
        .map(|k| {
            let t = k as f64 - center;
            let sinc = if t == 0.0 {
                2.0 * cutoff
            } else {
                (2.0 * std::f64::consts::PI * cutoff * t).sin() / (std::f64::consts::PI * t)
            };
            // Blackman window
            let w = 0.42
                - 0.5 * (2.0 * std::f64::consts::PI * k as f64 / (taps - 1) as f64).cos()
                + 0.08 * (4.0 * std::f64::consts::PI * k as f64 / (taps - 1) as f64).cos();
            sinc * w
        })
        .collect();

    let sum: f64 = h.iter().sum();
    for c in h.iter_mut() {
        *c /= sum;
    }
    h
}

/// 2x interpolation: zero-stuff to the output rate, lowpass at the original
/// Nyquist, compensate the filter's group delay.
fn upsample_2x(samples: &[i16]) -> Vec<i16> {
    let h = design_lowpass(0.25, HALFBAND_TAPS);
    let center = (HALFBAND_TAPS - 1) as i64 / 2;
    let n_out = samples.len() * 2;

    let mut out = Vec::with_capacity(n_out);
    for m in 0..n_out as i64 {
        let mut acc = 0.0f64;
        for (k, &coeff) in h.iter().enumerate() {
            let i = m + center - k as i64;
            // Only even taps of the zero-stuffed signal carry samples
            if i >= 0 && i % 2 == 0 {
                let idx = (i / 2) as usize;
                if idx < samples.len() {
                    acc += coeff * samples[idx] as f64;
                }
            }
        }
        // Interpolation gain compensates the inserted zeros
        out.push((acc * 2.0).clamp(i16::MIN as f64, i16::MAX as f64) as i16);
    }
    out
}

/// 2x decimation: lowpass at the target Nyquist, then keep every other sample
fn downsample_2x(samples: &[i16]) -> Vec<i16> {
    let h = design_lowpass(0.25, HALFBAND_TAPS);
    let center = (HALFBAND_TAPS - 1) as i64 / 2;
    let n_out = samples.len().div_ceil(2);

    let mut out = Vec::with_capacity(n_out);
    for n in 0..n_out as i64 {
        let mut acc = 0.0f64;
        for (k, &coeff) in h.iter().enumerate() {
            let i = 2 * n + center - k as i64;
            if i >= 0 && (i as usize) < samples.len() {
                acc += coeff * samples[i as usize] as f64;
            }
        }
        out.push(acc.clamp(i16::MIN as f64, i16::MAX as f64) as i16);
    }
    out
}

/// Arbitrary-ratio conversion via rubato's band-limited sinc resampler
fn resample_arbitrary(
    samples: &[i16],
    from_hz: u32,
    to_hz: u32,
) -> Result<Vec<i16>, ResampleError> {
    let ratio = to_hz as f64 / from_hz as f64;
    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, samples.len(), 1)
        .map_err(|e| ResampleError::Backend(e.to_string()))?;
    let delay = resampler.output_delay();

    let input = vec![samples_to_f32(samples)];
    let mut output = resampler
        .process(&input, None)
        .map_err(|e| ResampleError::Backend(e.to_string()))?;
    let tail = resampler
        .process_partial(None::<&[Vec<f32>]>, None)
        .map_err(|e| ResampleError::Backend(e.to_string()))?;

    let mut mono = output.remove(0);
    if let Some(t) = tail.into_iter().next() {
        mono.extend(t);
    }

    let expected = (samples.len() as f64 * ratio).round() as usize;
    let trimmed: Vec<f32> = mono
        .into_iter()
        .skip(delay)
        .take(expected)
        .collect();
    Ok(samples_to_i16(&trimmed))
}
