//! Conversation orchestrator
//!
//! Couples the per-call media pipeline and state machine to the model
//! workers over the bus. One task per call consumes that call's event
//! FIFO; dispatcher tasks route bus results to the right call by ID.

pub mod call_task;
pub mod fallback;

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::audio::Codec;
use crate::bus::{Bus, Payload, Topic};
use crate::call::{
    CallEvent, CallHandle, CallInstructions, CallRecord, CallRegistry, CallSnapshot,
    CallStateMachine,
};
use crate::pipeline::{CallPipeline, PipelineConfig, PipelineEvent};
use crate::rtp::{
    self, ChannelRecord, CorrelationMap, PortPool, RtpSessionConfig, SessionEvent,
};
use crate::stats::EngineStats;
use crate::store::{ArtifactStore, ConversationStore};
use crate::switch::{SwitchControl, SwitchEvent};
use crate::types::{CallDirection, CallId, ChannelId};

pub use call_task::{run_call, CallTaskContext};
pub use fallback::{FallbackCategory, FallbackResponses};

/// Orchestrator-level tuning (per-call instructions carry the rest)
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Local interface RTP sessions bind on
    pub bind_host: String,
    /// Address advertised to the switch for external media
    pub advertise_host: String,
    /// Negotiated media codec for new calls
    pub codec: Codec,
    pub pipeline: PipelineConfig,
    /// Default instructions for calls that bring none
    pub default_instructions: CallInstructions,
    pub conversation_max_tokens: u32,
    pub llm_max_tokens: u32,
    pub llm_temperature: f32,
    /// Utterances with a lower mean VAD confidence are not transcribed
    pub utterance_confidence_threshold: f32,
    pub bargein_enabled: bool,
    pub bargein_debounce_ms: u64,
    pub bargein_confidence_threshold: f32,
    pub fallback_enabled: bool,
    pub greeting_enabled: bool,
    /// Flush an open utterance after this much ingress silence
    pub silence_flush_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".into(),
            advertise_host: "127.0.0.1".into(),
            codec: Codec::Pcmu,
            pipeline: PipelineConfig::default(),
            default_instructions: CallInstructions::default(),
            conversation_max_tokens: 4000,
            llm_max_tokens: 256,
            llm_temperature: 0.7,
            utterance_confidence_threshold: 0.5,
            bargein_enabled: true,
            bargein_debounce_ms: 150,
            bargein_confidence_threshold: 0.6,
            fallback_enabled: true,
            greeting_enabled: false,
            silence_flush_ms: 2000,
        }
    }
}

/// Couples calls, bus and switch; owns no call state itself
pub struct Orchestrator {
    pub config: Arc<OrchestratorConfig>,
    pub bus: Arc<Bus>,
    pub registry: Arc<CallRegistry>,
    pub ports: Arc<PortPool>,
    pub correlation: Arc<CorrelationMap>,
    pub artifacts: Arc<ArtifactStore>,
    pub conversations: Arc<ConversationStore>,
    pub switch: Arc<dyn SwitchControl>,
    pub fallback: Arc<FallbackResponses>,
    pub stats: Arc<EngineStats>,
}

impl Orchestrator {
    /// Route model-worker results from the bus into per-call FIFOs. One
    /// task per topic keeps per-(topic, call) order.
    pub fn spawn_dispatchers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        for topic in [
            Topic::SttResult,
            Topic::LlmPartial,
            Topic::LlmResponse,
            Topic::LlmError,
            Topic::TtsReady,
            Topic::TtsFailed,
            Topic::CallControl,
        ] {
            let orchestrator = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut subscription = orchestrator.bus.subscribe(topic);
                loop {
                    let envelope = tokio::select! {
                        envelope = subscription.recv() => envelope,
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                    };

                    if let Err(e) = envelope.check_schema() {
                        warn!(%topic, error = %e, "incompatible envelope dropped");
                        continue;
                    }
                    let Some(call_id) = envelope.call_id.clone() else {
                        continue;
                    };
                    let Some(handle) = orchestrator.registry.get(&call_id) else {
                        debug!(%call_id, %topic, "result for unknown call dropped");
                        // A TTS artifact for a dead call must still be
                        // released
                        if let Payload::TtsReady { artifact } = &envelope.payload {
                            orchestrator.artifacts.delete(&artifact.artifact_id);
                        }
                        continue;
                    };

                    let correlation_id = envelope.correlation_id;
                    let event = match envelope.payload {
                        // Control actions address the call, not a turn
                        Payload::CallControl(action) => CallEvent::Control(action),
                        payload => {
                            // Everything else pairs with a turn
                            let Some(correlation_id) = correlation_id else {
                                continue;
                            };
                            match payload {
                                Payload::SttResult {
                                    text,
                                    confidence,
                                    is_final,
                                } => CallEvent::SttResult {
                                    correlation_id,
                                    text,
                                    confidence,
                                    is_final,
                                },
                                Payload::LlmPartial { delta } => CallEvent::LlmPartial {
                                    correlation_id,
                                    delta,
                                },
                                Payload::LlmResponse { text, .. } => CallEvent::LlmResponse {
                                    correlation_id,
                                    text,
                                },
                                Payload::LlmError { reason } => CallEvent::LlmFailed {
                                    correlation_id,
                                    reason,
                                },
                                Payload::TtsReady { artifact } => CallEvent::TtsReady {
                                    correlation_id,
                                    artifact,
                                },
                                Payload::TtsFailed { reason } => CallEvent::TtsFailed {
                                    correlation_id,
                                    reason,
                                },
                                _ => continue,
                            }
                        }
                    };
                    handle.send(event);
                }
            });
        }
    }

    /// React to the switch's event feed
    pub fn spawn_switch_router(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<SwitchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                };

                match event {
                    SwitchEvent::CallOffered { channel, caller } => {
                        let orchestrator = orchestrator.clone();
                        tokio::spawn(async move {
                            if let Err(e) = orchestrator
                                .start_call(channel.clone(), caller, CallDirection::Inbound, None)
                                .await
                            {
                                warn!(%channel, error = %e, "failed to start call");
                                let _ = orchestrator.switch.hangup(&channel).await;
                            }
                        });
                    }
                    SwitchEvent::ChannelAnswered { channel } => {
                        if let Some(handle) = orchestrator.registry.by_channel(&channel) {
                            handle.send(CallEvent::Answered);
                        }
                    }
                    SwitchEvent::PlaybackFinished { channel } => {
                        if let Some(handle) = orchestrator.registry.by_channel(&channel) {
                            handle.send(CallEvent::PlaybackFinished);
                        }
                    }
                    SwitchEvent::ChannelDestroyed { channel } => {
                        if let Some(handle) = orchestrator.registry.by_channel(&channel) {
                            handle.send(CallEvent::Hangup);
                        }
                    }
                    SwitchEvent::Dtmf { channel, digit } => {
                        if let Some(handle) = orchestrator.registry.by_channel(&channel) {
                            handle.send(CallEvent::Dtmf { digit });
                        }
                    }
                }
            }
        });
    }

    /// Allocate media and spawn the event loop for a new call.
    pub async fn start_call(
        self: &Arc<Self>,
        channel_id: ChannelId,
        caller_id: Option<String>,
        direction: CallDirection,
        instructions: Option<CallInstructions>,
    ) -> Result<CallId> {
        let call_id = CallId::new();
        let codec = self.config.codec;
        let instructions = instructions.unwrap_or_else(|| self.config.default_instructions.clone());

        // Port exhaustion is terminal for call creation
        let port = self.ports.lease(&call_id)?;

        self.correlation.register_call(
            call_id.clone(),
            ChannelRecord {
                channel_id: channel_id.clone(),
                local_port: port,
                remote: None,
                codec,
                ssrc: None,
            },
        );

        let mut record = CallRecord::new(
            call_id.clone(),
            channel_id.clone(),
            caller_id.clone(),
            direction,
            codec,
            instructions,
        );
        record.local_port = Some(port);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        // Media session feeds the same FIFO through a small adapter
        let (session_tx, mut session_rx) = mpsc::unbounded_channel();
        let pipeline = CallPipeline::new(
            call_id.clone(),
            codec.sample_rate(),
            &self.config.pipeline,
            self.stats.clone(),
        );
        let session = match rtp::session::spawn(
            RtpSessionConfig {
                call_id: call_id.clone(),
                codec,
                local_port: port,
                bind_host: self.config.bind_host.clone(),
                silence_flush: std::time::Duration::from_millis(self.config.silence_flush_ms),
            },
            pipeline,
            self.correlation.clone(),
            self.stats.clone(),
            session_tx,
            cancel_rx,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                self.ports.release(port);
                self.correlation.remove_call(&call_id);
                return Err(e.into());
            }
        };

        {
            let events_tx = events_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = session_rx.recv().await {
                    let mapped = match event {
                        SessionEvent::MediaBound => CallEvent::MediaBound,
                        SessionEvent::Pipeline(PipelineEvent::SpeechStarted) => {
                            CallEvent::SpeechStarted
                        }
                        SessionEvent::Pipeline(PipelineEvent::SpeechFrame { confidence }) => {
                            CallEvent::SpeechFrame { confidence }
                        }
                        SessionEvent::Pipeline(PipelineEvent::SpeechEnded) => {
                            CallEvent::SpeechEnded
                        }
                        SessionEvent::Pipeline(PipelineEvent::UtteranceReady(utterance)) => {
                            CallEvent::UtteranceReady(utterance)
                        }
                        SessionEvent::PipelineFailed(reason) => CallEvent::PipelineFailed(reason),
                        SessionEvent::EgressFinished => CallEvent::EgressFinished,
                    };
                    if events_tx.send(mapped).is_err() {
                        break;
                    }
                }
            });
        }

        let snapshot = CallSnapshot {
            call_id: call_id.clone(),
            channel_id: channel_id.clone(),
            caller_id,
            direction,
            state: record.state,
            codec,
            local_port: Some(port),
            created_at: Utc::now(),
            last_activity: Utc::now(),
            lost_packets: 0,
        };
        let handle = CallHandle::new(
            call_id.clone(),
            channel_id.clone(),
            events_tx,
            cancel_tx,
            snapshot,
        );
        self.registry.insert(handle.clone());

        info!(%call_id, %channel_id, port, %codec, "call starting");

        let context = CallTaskContext {
            machine: CallStateMachine::new(record),
            handle,
            events: events_rx,
            session,
            bus: self.bus.clone(),
            registry: self.registry.clone(),
            ports: self.ports.clone(),
            correlation: self.correlation.clone(),
            artifacts: self.artifacts.clone(),
            conversations: self.conversations.clone(),
            switch: self.switch.clone(),
            fallback: self.fallback.clone(),
            config: self.config.clone(),
            stats: self.stats.clone(),
        };
        tokio::spawn(run_call(context));

        Ok(call_id)
    }
}
