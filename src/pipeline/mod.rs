//! Per-call audio conditioning pipeline
//!
//! Ordered, replaceable stages operating on fixed 20 ms linear-PCM frames:
//! framing → echo cancellation → noise suppression → VAD → utterance
//! building. The pipeline is single-threaded per call; the RTP session task
//! that owns it calls in with decoded samples and forwards the resulting
//! events.

pub mod echo;
pub mod frame;
pub mod noise;
pub mod utterance;
pub mod vad;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use crate::stats::EngineStats;
use crate::types::{CallId, Utterance};
use echo::EchoCanceller;
use frame::{Framer, SourceTag};
use noise::{NoiseMode, NoiseSuppressor};
use utterance::{UtteranceBuilder, UtteranceConfig};
use vad::{Vad, VadConfig};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage '{stage}' failed: {reason}")]
    StageFailure { stage: &'static str, reason: String },
    #[error("pipeline is in a failed state")]
    Failed,
}

/// Pipeline tuning, combined from the `[pipeline]`, `[vad]`, `[echo]` and
/// `[noise]` config sections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub frame_ms: u32,
    pub echo_reference_ms: u32,
    pub noise_mode: NoiseMode,
    pub vad: VadConfig,
    pub utterance: UtteranceConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_ms: 20,
            echo_reference_ms: 200,
            noise_mode: NoiseMode::default(),
            vad: VadConfig::default(),
            utterance: UtteranceConfig::default(),
        }
    }
}

/// What the pipeline tells its owner about each batch of samples
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// An utterance opened (k_in speech frames observed)
    SpeechStarted,
    /// One speech frame inside an open utterance; drives barge-in debounce
    SpeechFrame { confidence: f32 },
    /// The open utterance closed (emitted or dropped as a blip)
    SpeechEnded,
    /// A complete utterance ready for transcription
    UtteranceReady(Utterance),
}

/// Context handed to conditioning stages
pub struct StageContext {
    /// Whether an utterance is currently open
    pub speech_active: bool,
}

/// A replaceable audio-conditioning stage
pub trait AudioStage: Send {
    fn name(&self) -> &'static str;
    fn process(&mut self, samples: &[i16], ctx: &StageContext) -> Result<Vec<i16>, String>;
    /// Far-end audio for stages that track the egress signal
    fn push_reference(&mut self, _samples: &[i16]) {}
    fn reset(&mut self);
}

struct EchoStage(EchoCanceller);

impl AudioStage for EchoStage {
    fn name(&self) -> &'static str {
        "echo_cancellation"
    }

    fn process(&mut self, samples: &[i16], _ctx: &StageContext) -> Result<Vec<i16>, String> {
        Ok(self.0.process(samples))
    }

    fn push_reference(&mut self, samples: &[i16]) {
        self.0.push_reference(samples);
    }

    fn reset(&mut self) {
        self.0.reset();
    }
}

struct NoiseStage(NoiseSuppressor);

impl AudioStage for NoiseStage {
    fn name(&self) -> &'static str {
        "noise_suppression"
    }

    fn process(&mut self, samples: &[i16], ctx: &StageContext) -> Result<Vec<i16>, String> {
        Ok(self.0.process(samples, ctx.speech_active))
    }

    fn reset(&mut self) {
        self.0.reset();
    }
}

/// Per-call counters; every increment is mirrored into the engine-wide
/// aggregate the status endpoint serves
#[derive(Debug, Default, Clone, Serialize)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub utterances_emitted: u64,
    pub stage_failures: u64,
}

/// The conditioning pipeline for one call
pub struct CallPipeline {
    call_id: CallId,
    framer: Framer,
    stages: Vec<Box<dyn AudioStage>>,
    vad: Vad,
    builder: UtteranceBuilder,
    stats: PipelineStats,
    engine_stats: Arc<EngineStats>,
    failed: bool,
}

impl CallPipeline {
    pub fn new(
        call_id: CallId,
        sample_rate: u32,
        config: &PipelineConfig,
        engine_stats: Arc<EngineStats>,
    ) -> Self {
        let framer = Framer::new(sample_rate, config.frame_ms, SourceTag::Ingress);
        let frame_samples = framer.frame_samples();

        let stages: Vec<Box<dyn AudioStage>> = vec![
            Box::new(EchoStage(EchoCanceller::new(
                sample_rate,
                config.echo_reference_ms,
            ))),
            Box::new(NoiseStage(NoiseSuppressor::new(
                config.noise_mode,
                frame_samples,
            ))),
        ];

        Self {
            builder: UtteranceBuilder::new(call_id.clone(), config.utterance),
            call_id,
            framer,
            stages,
            vad: Vad::new(config.vad),
            stats: PipelineStats::default(),
            engine_stats,
            failed: false,
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Feed far-end (egress) audio as the echo-cancellation reference
    pub fn push_reference(&mut self, samples: &[i16]) {
        for stage in self.stages.iter_mut() {
            stage.push_reference(samples);
        }
    }

    /// Process decoded caller samples, emitting pipeline events
    pub fn process(&mut self, samples: &[i16]) -> Result<Vec<PipelineEvent>, PipelineError> {
        if self.failed {
            return Err(PipelineError::Failed);
        }

        let mut events = Vec::new();
        for mut audio_frame in self.framer.push(samples) {
            let ctx = StageContext {
                speech_active: self.builder.is_open(),
            };

            let mut current = audio_frame.samples;
            for stage in self.stages.iter_mut() {
                match stage.process(&current, &ctx) {
                    Ok(processed) => current = processed,
                    Err(reason) => {
                        self.failed = true;
                        self.stats.stage_failures += 1;
                        self.engine_stats.record_stage_failure();
                        error!(
                            call_id = %self.call_id,
                            stage = stage.name(),
                            %reason,
                            "pipeline stage failed"
                        );
                        return Err(PipelineError::StageFailure {
                            stage: stage.name(),
                            reason,
                        });
                    }
                }
            }
            audio_frame.samples = current;

            let decision = self.vad.classify(&audio_frame);
            audio_frame.is_speech = Some(decision.is_speech);
            self.stats.frames_processed += 1;
            self.engine_stats.record_frame_processed();

            let was_open = self.builder.is_open();
            if decision.is_speech && was_open {
                events.push(PipelineEvent::SpeechFrame {
                    confidence: decision.confidence,
                });
            }

            let closed = self.builder.push(audio_frame, decision);
            let now_open = self.builder.is_open();

            if !was_open && now_open {
                events.push(PipelineEvent::SpeechStarted);
                events.push(PipelineEvent::SpeechFrame {
                    confidence: decision.confidence,
                });
            }
            if was_open && !now_open {
                events.push(PipelineEvent::SpeechEnded);
            }
            if let Some(utterance) = closed {
                self.stats.utterances_emitted += 1;
                self.engine_stats.record_utterance_emitted();
                events.push(PipelineEvent::UtteranceReady(utterance));
            }
        }
        Ok(events)
    }

    /// Flush any open utterance (silence timeout / talk-spurt boundary)
    pub fn flush(&mut self) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        let was_open = self.builder.is_open();
        if let Some(utterance) = self.builder.flush() {
            self.stats.utterances_emitted += 1;
            self.engine_stats.record_utterance_emitted();
            events.push(PipelineEvent::UtteranceReady(utterance));
        }
        if was_open {
            events.push(PipelineEvent::SpeechEnded);
        }
        events
    }

    /// Drop buffered state after a talk-spurt discontinuity
    pub fn clear_partial(&mut self) {
        if self.framer.pending() > 0 {
            warn!(
                call_id = %self.call_id,
                pending = self.framer.pending(),
                "dropping partial frame at talk-spurt boundary"
            );
        }
        self.framer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Speech-shaped signal: louder than the ambient level by a wide margin
    fn speech_chunk(len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| ((i as f32 * 0.7).sin() * 12000.0) as i16)
            .collect()
    }

    fn silence_chunk(len: usize) -> Vec<i16> {
        vec![0i16; len]
    }

    fn pipeline() -> CallPipeline {
        pipeline_with_stats(Arc::new(EngineStats::default()))
    }

    fn pipeline_with_stats(engine_stats: Arc<EngineStats>) -> CallPipeline {
        let config = PipelineConfig {
            // Noise suppression off so the synthetic levels survive intact
            noise_mode: NoiseMode::Off,
            ..Default::default()
        };
        CallPipeline::new(CallId::from("pipe-test"), 8000, &config, engine_stats)
    }

    #[test]
    fn test_speech_run_emits_one_utterance() {
        let mut p = pipeline();

        // Establish the noise floor
        for _ in 0..10 {
            p.process(&silence_chunk(160)).unwrap();
        }

        let mut utterances = Vec::new();
        let mut speech_started = 0;

        // 300 ms of speech
        for _ in 0..15 {
            for e in p.process(&speech_chunk(160)).unwrap() {
                match e {
                    PipelineEvent::UtteranceReady(u) => utterances.push(u),
                    PipelineEvent::SpeechStarted => speech_started += 1,
                    _ => {}
                }
            }
        }
        // 1700 ms of silence
        for _ in 0..85 {
            for e in p.process(&silence_chunk(160)).unwrap() {
                if let PipelineEvent::UtteranceReady(u) = e {
                    utterances.push(u);
                }
            }
        }

        assert_eq!(speech_started, 1);
        assert_eq!(utterances.len(), 1);
        let u = &utterances[0];
        assert!(
            (280..=320).contains(&u.duration_ms),
            "utterance duration {} out of expected range",
            u.duration_ms
        );
        assert!(!u.forced);
    }

    #[test]
    fn test_speech_frames_reported_during_utterance() {
        let mut p = pipeline();
        for _ in 0..10 {
            p.process(&silence_chunk(160)).unwrap();
        }
        let mut speech_frames = 0;
        for _ in 0..15 {
            for e in p.process(&speech_chunk(160)).unwrap() {
                if matches!(e, PipelineEvent::SpeechFrame { .. }) {
                    speech_frames += 1;
                }
            }
        }
        assert!(speech_frames >= 10, "only {speech_frames} speech frames seen");
    }

    #[test]
    fn test_partial_frames_buffered_across_pushes() {
        let mut p = pipeline();
        // 100-sample pushes never align with the 160-sample frame
        for _ in 0..8 {
            p.process(&silence_chunk(100)).unwrap();
        }
        assert_eq!(p.stats().frames_processed, 5);
    }

    #[test]
    fn test_flush_emits_open_utterance() {
        let mut p = pipeline();
        for _ in 0..10 {
            p.process(&silence_chunk(160)).unwrap();
        }
        for _ in 0..15 {
            p.process(&speech_chunk(160)).unwrap();
        }
        let events = p.flush();
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::UtteranceReady(_))));
    }

    #[test]
    fn test_engine_stats_mirrored() {
        let engine_stats = Arc::new(EngineStats::default());
        let mut p = pipeline_with_stats(engine_stats.clone());

        for _ in 0..10 {
            p.process(&silence_chunk(160)).unwrap();
        }
        for _ in 0..15 {
            p.process(&speech_chunk(160)).unwrap();
        }
        for _ in 0..20 {
            p.process(&silence_chunk(160)).unwrap();
        }

        let snapshot = engine_stats.snapshot();
        assert_eq!(snapshot.frames_processed, 45);
        assert_eq!(snapshot.utterances_emitted, 1);
        assert_eq!(snapshot.utterances_emitted, p.stats().utterances_emitted);
    }

    #[test]
    fn test_stage_failure_poisons_pipeline() {
        struct FailingStage;
        impl AudioStage for FailingStage {
            fn name(&self) -> &'static str {
                "failing"
            }
            fn process(&mut self, _: &[i16], _: &StageContext) -> Result<Vec<i16>, String> {
                Err("boom".into())
            }
            fn reset(&mut self) {}
        }

        let mut p = pipeline();
        p.stages.push(Box::new(FailingStage));

        let err = p.process(&silence_chunk(160)).unwrap_err();
        assert!(matches!(err, PipelineError::StageFailure { stage: "failing", .. }));
        // Subsequent pushes keep failing
        assert!(matches!(
            p.process(&silence_chunk(160)).unwrap_err(),
            PipelineError::Failed
        ));
        assert_eq!(p.stats().stage_failures, 1);
    }
}
