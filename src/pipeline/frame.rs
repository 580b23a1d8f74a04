//! Audio framing
//!
//! Buffers raw decoded samples into fixed-size frames. Partial frames are
//! never emitted; leftover samples wait for the next push. Frames are
//! immutable once emitted from the stage that produced them.

use chrono::{DateTime, Utc};

/// Where a frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTag {
    /// Caller audio decoded off the wire
    Ingress,
    /// Synthesized audio on its way to the caller
    Egress,
}

/// One fixed-duration block of linear PCM with its metadata
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    /// Set by the VAD stage; None before classification
    pub is_speech: Option<bool>,
    pub source: SourceTag,
}

impl AudioFrame {
    /// RMS energy of the frame, normalized to [0, 1]
    pub fn energy(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .samples
            .iter()
            .map(|&s| {
                let v = s as f64 / 32768.0;
                v * v
            })
            .sum();
        (sum / self.samples.len() as f64).sqrt() as f32
    }
}

/// Accumulates samples and cuts them into fixed frames
pub struct Framer {
    sample_rate: u32,
    frame_ms: u32,
    frame_samples: usize,
    buffer: Vec<i16>,
    source: SourceTag,
}

impl Framer {
    pub fn new(sample_rate: u32, frame_ms: u32, source: SourceTag) -> Self {
        let frame_samples = (sample_rate as usize / 1000) * frame_ms as usize;
        Self {
            sample_rate,
            frame_ms,
            frame_samples,
            buffer: Vec::with_capacity(frame_samples * 2),
            source,
        }
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Push raw samples, emitting every complete frame they yield
    pub fn push(&mut self, samples: &[i16]) -> Vec<AudioFrame> {
        self.buffer.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.buffer.len() >= self.frame_samples {
            let chunk: Vec<i16> = self.buffer.drain(..self.frame_samples).collect();
            frames.push(AudioFrame {
                samples: chunk,
                timestamp: Utc::now(),
                duration_ms: self.frame_ms,
                sample_rate: self.sample_rate,
                channels: 1,
                bit_depth: 16,
                is_speech: None,
                source: self.source,
            });
        }
        frames
    }

    /// Samples currently waiting for a complete frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_partial_frames() {
        let mut framer = Framer::new(8000, 20, SourceTag::Ingress);
        assert_eq!(framer.frame_samples(), 160);

        let frames = framer.push(&[0i16; 100]);
        assert!(frames.is_empty());
        assert_eq!(framer.pending(), 100);

        let frames = framer.push(&[0i16; 100]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples.len(), 160);
        assert_eq!(framer.pending(), 40);
    }

    #[test]
    fn test_multiple_frames_per_push() {
        let mut framer = Framer::new(8000, 20, SourceTag::Ingress);
        let frames = framer.push(&[0i16; 500]);
        assert_eq!(frames.len(), 3);
        assert_eq!(framer.pending(), 20);
    }

    #[test]
    fn test_frame_metadata() {
        let mut framer = Framer::new(16000, 20, SourceTag::Egress);
        let frames = framer.push(&[100i16; 320]);
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.sample_rate, 16000);
        assert_eq!(frame.duration_ms, 20);
        assert_eq!(frame.channels, 1);
        assert_eq!(frame.bit_depth, 16);
        assert_eq!(frame.source, SourceTag::Egress);
        assert!(frame.is_speech.is_none());
    }

    #[test]
    fn test_energy() {
        let mut framer = Framer::new(8000, 20, SourceTag::Ingress);
        let silence = framer.push(&[0i16; 160]);
        assert_eq!(silence[0].energy(), 0.0);

        let loud = framer.push(&[16384i16; 160]);
        assert!((loud[0].energy() - 0.5).abs() < 0.01);
    }
}
