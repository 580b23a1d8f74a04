//! Per-call event loop
//!
//! The single consumer of a call's event FIFO. It owns the state machine,
//! the conversation and the turn bookkeeping, couples the pipeline and the
//! switch to the model workers over the bus, and enforces the
//! single-responder invariant: at most one in-flight LLM and one in-flight
//! TTS per call, keyed by the turn's correlation ID. Late results whose
//! correlation no longer matches are discarded.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::fallback::{FallbackCategory, FallbackResponses};
use super::OrchestratorConfig;
use crate::bus::{Bus, Envelope, Payload};
use crate::call::{CallEvent, CallHandle, CallRegistry, CallState, CallStateMachine};
use crate::conversation::Conversation;
use crate::rtp::{CorrelationMap, EgressCommand, PortPool, RtpSessionHandle};
use crate::stats::EngineStats;
use crate::store::{ArtifactStore, ConversationStore};
use crate::switch::SwitchControl;
use crate::types::{CorrelationId, Role, Utterance};
use uuid::Uuid;

/// Which stage of a turn is outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Idle,
    Stt,
    Llm,
    Tts,
    Speaking,
}

/// Bookkeeping for the current conversational turn
struct TurnState {
    correlation: Option<CorrelationId>,
    awaiting: Awaiting,
    /// Last text handed to TTS, for the switch-say degradation path
    pending_text: Option<String>,
    artifact_id: Option<String>,
    recovery_attempted: bool,
}

impl TurnState {
    fn idle() -> Self {
        Self {
            correlation: None,
            awaiting: Awaiting::Idle,
            pending_text: None,
            artifact_id: None,
            recovery_attempted: false,
        }
    }

    fn matches(&self, correlation: CorrelationId) -> bool {
        self.correlation == Some(correlation)
    }
}

/// Debounce for barge-in: speech must persist with enough confidence
/// before it counts as an interruption.
struct BargeDetector {
    enabled: bool,
    required_frames: u32,
    confidence_threshold: f32,
    run: u32,
}

impl BargeDetector {
    fn new(enabled: bool, debounce_ms: u64, confidence_threshold: f32, frame_ms: u32) -> Self {
        Self {
            enabled,
            required_frames: (debounce_ms / frame_ms as u64).max(1) as u32,
            confidence_threshold,
            run: 0,
        }
    }

    /// Feed one speech frame; true when the debounce threshold is crossed
    fn on_speech_frame(&mut self, confidence: f32) -> bool {
        if !self.enabled {
            return false;
        }
        if confidence >= self.confidence_threshold {
            self.run += 1;
        } else {
            self.run = 0;
        }
        self.run >= self.required_frames
    }

    fn reset(&mut self) {
        self.run = 0;
    }
}

/// Everything the loop needs, wired up by the orchestrator
pub struct CallTaskContext {
    pub machine: CallStateMachine,
    pub handle: CallHandle,
    pub events: mpsc::UnboundedReceiver<CallEvent>,
    pub session: RtpSessionHandle,
    pub bus: Arc<Bus>,
    pub registry: Arc<CallRegistry>,
    pub ports: Arc<PortPool>,
    pub correlation: Arc<CorrelationMap>,
    pub artifacts: Arc<ArtifactStore>,
    pub conversations: Arc<ConversationStore>,
    pub switch: Arc<dyn SwitchControl>,
    pub fallback: Arc<FallbackResponses>,
    pub config: Arc<OrchestratorConfig>,
    pub stats: Arc<EngineStats>,
}

pub async fn run_call(ctx: CallTaskContext) {
    CallTask::new(ctx).run().await;
}

struct CallTask {
    ctx: CallTaskContext,
    conversation: Option<Conversation>,
    turn: TurnState,
    barge: BargeDetector,
    greeted: bool,
    silence_deadline: Instant,
    response_deadline: Option<Instant>,
}

impl CallTask {
    fn new(ctx: CallTaskContext) -> Self {
        let instructions = &ctx.machine.record().instructions;
        let barge = BargeDetector::new(
            ctx.config.bargein_enabled,
            ctx.config.bargein_debounce_ms,
            ctx.config.bargein_confidence_threshold,
            ctx.config.pipeline.frame_ms,
        );
        let silence_deadline =
            Instant::now() + Duration::from_secs(instructions.silence_timeout_s);
        Self {
            ctx,
            conversation: None,
            turn: TurnState::idle(),
            barge,
            greeted: false,
            silence_deadline,
            response_deadline: None,
        }
    }

    async fn run(mut self) {
        let call_id = self.ctx.machine.record().call_id.clone();
        let channel = self.ctx.machine.record().channel_id.clone();

        // Pick the call up; the switch's answer-confirmation event will
        // also arrive but is idempotent here.
        match self.ctx.switch.answer(&channel).await {
            Ok(()) => {
                self.handle_event(CallEvent::Answered).await;
                let switch = self.ctx.switch.clone();
                let channel = channel.clone();
                let host = self.ctx.config.advertise_host.clone();
                let port = self.ctx.session.local_port;
                let format = self.ctx.machine.record().codec.name().to_lowercase();
                tokio::spawn(async move {
                    if let Err(e) = switch
                        .start_external_media(&channel, &host, port, &format)
                        .await
                    {
                        warn!(%channel, error = %e, "external media setup failed");
                    }
                });
            }
            Err(e) => {
                warn!(%call_id, error = %e, "answer failed");
                let _ = self.ctx.machine.fail(format!("answer failed: {e}"));
            }
        }
        self.publish_snapshot();

        let max_deadline = Instant::now()
            + Duration::from_secs(self.ctx.machine.record().instructions.max_call_duration_s);

        while !self.ctx.machine.state().is_terminal() {
            let response_at = self
                .response_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

            tokio::select! {
                event = self.ctx.events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(max_deadline) => {
                    self.handle_event(CallEvent::MaxDurationReached).await;
                }
                _ = tokio::time::sleep_until(self.silence_deadline) => {
                    self.handle_event(CallEvent::SilenceTimeout).await;
                }
                _ = tokio::time::sleep_until(response_at) => {
                    self.response_deadline = None;
                    self.handle_event(CallEvent::ResponseTimeout).await;
                }
            }

            self.publish_snapshot();
        }

        self.cleanup().await;
    }

    fn publish_snapshot(&self) {
        let record = self.ctx.machine.record();
        let stats = self.ctx.session.stats();
        self.ctx.handle.update_snapshot(|s| {
            s.state = record.state;
            s.last_activity = record.last_activity;
            s.lost_packets = stats.lost_packets;
        });
    }

    fn reset_silence(&mut self) {
        let timeout = self.ctx.machine.record().instructions.silence_timeout_s;
        self.silence_deadline = Instant::now() + Duration::from_secs(timeout);
    }

    fn arm_response_deadline(&mut self) {
        let timeout = self.ctx.machine.record().instructions.response_timeout_s;
        self.response_deadline = Some(Instant::now() + Duration::from_secs(timeout));
    }

    async fn handle_event(&mut self, event: CallEvent) {
        match event {
            CallEvent::Answered => {
                if self.ctx.machine.state() == CallState::Ringing {
                    let _ = self.ctx.machine.transition(CallState::Connected);
                    self.reset_silence();
                } else {
                    debug!("duplicate answer confirmation ignored");
                }
            }

            CallEvent::MediaBound => {
                if self.ctx.machine.state() == CallState::Connected {
                    let _ = self.ctx.machine.transition(CallState::Listening);
                    self.reset_silence();
                    if self.ctx.config.greeting_enabled && !self.greeted {
                        self.greeted = true;
                        self.speak_scripted(FallbackCategory::Greeting).await;
                    }
                }
            }

            CallEvent::SpeechStarted => {
                self.ctx.machine.touch_activity();
                self.reset_silence();
            }

            CallEvent::SpeechFrame { confidence } => {
                self.ctx.machine.touch_activity();
                self.reset_silence();
                if self.ctx.machine.state() == CallState::Speaking
                    && self.barge.on_speech_frame(confidence)
                {
                    self.barge_in(confidence).await;
                }
            }

            CallEvent::SpeechEnded => {
                self.barge.reset();
            }

            CallEvent::UtteranceReady(utterance) => {
                self.on_utterance(utterance).await;
            }

            CallEvent::SttResult {
                correlation_id,
                text,
                confidence,
                is_final,
            } => {
                self.on_stt_result(correlation_id, text, confidence, is_final)
                    .await;
            }

            CallEvent::LlmPartial { correlation_id, .. } => {
                // Partials are informational; the turn advances on the
                // final response.
                if !self.turn.matches(correlation_id) {
                    debug!("stale llm partial discarded");
                }
            }

            CallEvent::LlmResponse {
                correlation_id,
                text,
            } => {
                self.on_llm_response(correlation_id, text).await;
            }

            CallEvent::LlmFailed {
                correlation_id,
                reason,
            } => {
                if self.turn.matches(correlation_id) && self.turn.awaiting == Awaiting::Llm {
                    warn!(reason = %reason, "LLM turn failed, taking fallback path");
                    if self.ctx.config.fallback_enabled {
                        self.speak_fallback(FallbackCategory::ErrorGeneric).await;
                    } else {
                        self.finish_turn_to_listening();
                    }
                }
            }

            CallEvent::TtsReady {
                correlation_id,
                artifact,
            } => {
                self.on_tts_ready(correlation_id, artifact).await;
            }

            CallEvent::TtsFailed {
                correlation_id,
                reason,
            } => {
                if self.turn.matches(correlation_id) && self.turn.awaiting == Awaiting::Tts {
                    warn!(reason = %reason, "TTS failed, degrading to switch say");
                    let text = self
                        .turn
                        .pending_text
                        .clone()
                        .or_else(|| self.ctx.fallback.pick(FallbackCategory::ErrorGeneric))
                        .unwrap_or_default();
                    let switch = self.ctx.switch.clone();
                    let channel = self.ctx.machine.record().channel_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = switch.say(&channel, &text).await {
                            warn!(error = %e, "switch say failed");
                        }
                    });
                    self.finish_turn_to_listening();
                }
            }

            CallEvent::PlaybackFinished | CallEvent::EgressFinished => {
                if self.ctx.machine.state() == CallState::Speaking {
                    self.complete_playback();
                }
            }

            CallEvent::Dtmf { digit } => {
                self.ctx.machine.touch_activity();
                self.reset_silence();
                self.ctx
                    .machine
                    .record_mut()
                    .instructions
                    .metadata
                    .insert("last_dtmf".into(), digit.to_string());
            }

            CallEvent::Control(action) => {
                self.handle_control(action).await;
            }

            CallEvent::Hangup => {
                info!("hangup received");
                let _ = self.ctx.machine.transition(CallState::Ended);
            }

            CallEvent::UpdateInstructions(instructions) => {
                info!("instructions updated");
                self.ctx.machine.record_mut().instructions = *instructions;
            }

            CallEvent::PipelineFailed(reason) => {
                let _ = self.ctx.machine.fail(format!("pipeline: {reason}"));
            }

            CallEvent::Fatal(reason) => {
                let _ = self.ctx.machine.fail(reason);
            }

            CallEvent::SilenceTimeout => {
                let state = self.ctx.machine.state();
                if matches!(
                    state,
                    CallState::Connected | CallState::Listening | CallState::Processing
                ) {
                    info!("silence timeout");
                    let _ = self.ctx.machine.transition(CallState::Timeout);
                } else {
                    self.reset_silence();
                }
            }

            CallEvent::MaxDurationReached => {
                info!("max call duration reached");
                let _ = self.ctx.machine.transition(CallState::Timeout);
            }

            CallEvent::ResponseTimeout => {
                if self.ctx.machine.state() != CallState::Processing {
                    return;
                }
                if self.ctx.config.fallback_enabled && !self.turn.recovery_attempted {
                    warn!("response timeout, speaking recovery utterance");
                    self.turn.recovery_attempted = true;
                    self.speak_fallback(FallbackCategory::ErrorGeneric).await;
                } else {
                    warn!("response timeout with no recovery left");
                    let _ = self.ctx.machine.transition(CallState::Timeout);
                }
            }
        }
    }

    /// Out-of-band control actions published on `call.control`
    async fn handle_control(&mut self, action: crate::bus::ControlAction) {
        use crate::bus::ControlAction;
        let channel = self.ctx.machine.record().channel_id.clone();
        match action {
            ControlAction::PlayAudio { handle } => {
                let switch = self.ctx.switch.clone();
                tokio::spawn(async move {
                    if let Err(e) = switch.play(&channel, &handle).await {
                        warn!(error = %e, "control play failed");
                    }
                });
            }
            ControlAction::StopAudio => {
                let _ = self.ctx.session.egress.send(EgressCommand::Stop).await;
                let switch = self.ctx.switch.clone();
                tokio::spawn(async move {
                    if let Err(e) = switch.stop_playback(&channel).await {
                        warn!(error = %e, "control stop failed");
                    }
                });
            }
            ControlAction::EndConversation => {
                let _ = self.ctx.machine.transition(CallState::Ended);
            }
            ControlAction::GenerateResponse { text } => {
                // Speak supplied text as its own agent-initiated turn
                if self.ctx.machine.state() == CallState::Listening {
                    let correlation = Uuid::new_v4();
                    self.turn = TurnState {
                        correlation: Some(correlation),
                        awaiting: Awaiting::Idle,
                        pending_text: None,
                        artifact_id: None,
                        recovery_attempted: false,
                    };
                    let _ = self.ctx.machine.transition(CallState::Processing);
                    self.arm_response_deadline();
                    self.request_tts(correlation, text).await;
                } else {
                    debug!("generate_response ignored outside LISTENING");
                }
            }
        }
    }

    async fn on_utterance(&mut self, utterance: Utterance) {
        let state = self.ctx.machine.state();
        if state != CallState::Listening {
            debug!(%state, "utterance ignored outside LISTENING");
            return;
        }
        if !utterance.forced
            && utterance.confidence < self.ctx.config.utterance_confidence_threshold
        {
            debug!(
                confidence = utterance.confidence,
                "low-confidence utterance not transcribed"
            );
            return;
        }

        let record = self.ctx.machine.record();
        let call_id = record.call_id.clone();

        // The conversation is born with the first user utterance
        if self.conversation.is_none() {
            self.conversation = Some(Conversation::new(
                call_id.clone(),
                &record.instructions.system_prompt,
                self.ctx.config.conversation_max_tokens,
            ));
            self.ctx.stats.record_conversation_created();
        }

        let correlation = Uuid::new_v4();
        self.turn = TurnState {
            correlation: Some(correlation),
            awaiting: Awaiting::Stt,
            pending_text: None,
            artifact_id: None,
            recovery_attempted: false,
        };

        let language = record.instructions.language.clone();
        let envelope = Envelope::for_call(
            Payload::SttRequest {
                audio: utterance.audio,
                sample_rate: utterance.sample_rate,
                language,
            },
            call_id,
        )
        .with_correlation(correlation);
        let envelope = match &self.conversation {
            Some(c) => envelope.with_conversation(c.conversation_id.clone()),
            None => envelope,
        };

        if let Err(e) = self.ctx.bus.publish(envelope).await {
            warn!(error = %e, "stt request publish failed");
        }
        let _ = self.ctx.machine.transition(CallState::Processing);
        self.arm_response_deadline();
    }

    async fn on_stt_result(
        &mut self,
        correlation_id: CorrelationId,
        text: String,
        _confidence: f32,
        is_final: bool,
    ) {
        if !self.turn.matches(correlation_id) || self.turn.awaiting != Awaiting::Stt {
            debug!("stale stt result discarded");
            return;
        }
        if !is_final {
            return;
        }

        let trimmed = text.trim();
        if trimmed.is_empty() {
            // Backend timed out or heard nothing
            if self.ctx.config.fallback_enabled {
                self.speak_fallback(FallbackCategory::ErrorStt).await;
            } else {
                self.finish_turn_to_listening();
            }
            return;
        }

        let conversation = self
            .conversation
            .as_mut()
            .expect("conversation exists once a turn started");
        conversation.add_message(Role::User, trimmed);
        if let Err(e) = self.ctx.conversations.save(conversation).await {
            warn!(error = %e, "conversation save failed");
        }

        let messages = conversation.to_chat_messages();
        self.turn.awaiting = Awaiting::Llm;

        let envelope = Envelope::for_call(
            Payload::LlmRequest {
                messages,
                max_tokens: self.ctx.config.llm_max_tokens,
                temperature: self.ctx.config.llm_temperature,
            },
            self.ctx.machine.record().call_id.clone(),
        )
        .with_correlation(correlation_id);
        if let Err(e) = self.ctx.bus.publish(envelope).await {
            warn!(error = %e, "llm request publish failed");
        }
    }

    async fn on_llm_response(&mut self, correlation_id: CorrelationId, text: String) {
        if !self.turn.matches(correlation_id) || self.turn.awaiting != Awaiting::Llm {
            debug!("stale llm response discarded");
            return;
        }

        if text.trim().is_empty() {
            debug!("empty LLM response, returning to listening");
            self.finish_turn_to_listening();
            return;
        }

        let conversation = self
            .conversation
            .as_mut()
            .expect("conversation exists once a turn started");
        conversation.add_message(Role::Assistant, text.trim());
        if let Err(e) = self.ctx.conversations.save(conversation).await {
            warn!(error = %e, "conversation save failed");
        }

        self.request_tts(correlation_id, text.trim().to_string()).await;
    }

    async fn on_tts_ready(
        &mut self,
        correlation_id: CorrelationId,
        artifact: crate::store::TtsArtifact,
    ) {
        if !self.turn.matches(correlation_id) || self.turn.awaiting != Awaiting::Tts {
            debug!(artifact_id = %artifact.artifact_id, "late TTS artifact discarded");
            self.ctx.artifacts.delete(&artifact.artifact_id);
            return;
        }

        // Stream the synthesized audio onto the wire ourselves...
        match self.ctx.artifacts.read_pcm(&artifact.artifact_id) {
            Ok(samples) => {
                if self
                    .ctx
                    .session
                    .egress
                    .send(EgressCommand::Play(samples))
                    .await
                    .is_err()
                {
                    warn!("egress channel closed");
                }
            }
            Err(e) => warn!(error = %e, "artifact unreadable for egress"),
        }

        // ...and tell the switch to play the artifact handle out of band
        let switch = self.ctx.switch.clone();
        let channel = self.ctx.machine.record().channel_id.clone();
        let handle = artifact.handle.clone();
        tokio::spawn(async move {
            if let Err(e) = switch.play(&channel, &handle).await {
                warn!(error = %e, "switch play failed");
            }
        });

        self.turn.artifact_id = Some(artifact.artifact_id);
        self.turn.awaiting = Awaiting::Speaking;
        self.response_deadline = None;
        self.barge.reset();
        let _ = self.ctx.machine.transition(CallState::Speaking);
    }

    /// Ask TTS to speak `text` within the current turn
    async fn request_tts(&mut self, correlation_id: CorrelationId, text: String) {
        let record = self.ctx.machine.record();
        self.turn.awaiting = Awaiting::Tts;
        self.turn.pending_text = Some(text.clone());

        let envelope = Envelope::for_call(
            Payload::TtsRequest {
                text,
                voice: record.instructions.voice.clone(),
                encoding: "wav".into(),
                sample_rate: record.codec.sample_rate(),
            },
            record.call_id.clone(),
        )
        .with_correlation(correlation_id);
        if let Err(e) = self.ctx.bus.publish(envelope).await {
            warn!(error = %e, "tts request publish failed");
        }
    }

    /// Speak a scripted response inside the current turn (model failure)
    async fn speak_fallback(&mut self, category: FallbackCategory) {
        let Some(text) = self.ctx.fallback.pick(category) else {
            self.finish_turn_to_listening();
            return;
        };
        let correlation = self
            .turn
            .correlation
            .unwrap_or_else(Uuid::new_v4);
        self.turn.correlation = Some(correlation);
        self.request_tts(correlation, text).await;
    }

    /// Speak a scripted response as its own turn (greeting)
    async fn speak_scripted(&mut self, category: FallbackCategory) {
        if self.ctx.machine.state() != CallState::Listening {
            return;
        }
        let Some(text) = self.ctx.fallback.pick(category) else {
            return;
        };
        let correlation = Uuid::new_v4();
        self.turn = TurnState {
            correlation: Some(correlation),
            awaiting: Awaiting::Idle,
            pending_text: None,
            artifact_id: None,
            recovery_attempted: false,
        };
        let _ = self.ctx.machine.transition(CallState::Processing);
        self.arm_response_deadline();
        self.request_tts(correlation, text).await;
    }

    /// Debounced user interruption of agent speech
    async fn barge_in(&mut self, confidence: f32) {
        let record = self.ctx.machine.record();
        let call_id = record.call_id.clone();
        let channel = record.channel_id.clone();
        let correlation = self.turn.correlation;
        info!(%call_id, confidence, "barge-in detected");

        // Announce, then cancel whatever is still in flight for this turn
        let mut envelope = Envelope::for_call(Payload::BargeIn { confidence }, call_id.clone());
        envelope.correlation_id = correlation;
        if let Err(e) = self.ctx.bus.publish(envelope).await {
            warn!(error = %e, "barge-in publish failed");
        }

        if let Some(correlation) = correlation {
            for payload in [Payload::LlmCancel, Payload::TtsCancel] {
                let envelope =
                    Envelope::for_call(payload, call_id.clone()).with_correlation(correlation);
                if let Err(e) = self.ctx.bus.publish(envelope).await {
                    warn!(error = %e, "cancel publish failed");
                }
            }
        }

        // Kill our own egress immediately; the switch stop is idempotent
        // and runs concurrently so a slow switch cannot stall the loop.
        let _ = self.ctx.session.egress.send(EgressCommand::Stop).await;
        let switch = self.ctx.switch.clone();
        tokio::spawn(async move {
            if let Err(e) = switch.stop_playback(&channel).await {
                warn!(error = %e, "stop playback failed");
            }
        });

        if let Some(artifact_id) = self.turn.artifact_id.take() {
            self.ctx.artifacts.delete(&artifact_id);
        }

        let _ = self.ctx.machine.transition(CallState::BargingIn);
        let _ = self.ctx.machine.transition(CallState::Listening);
        self.turn = TurnState::idle();
        self.barge.reset();
        self.reset_silence();
    }

    /// Playback finished normally: release the artifact, close the turn
    fn complete_playback(&mut self) {
        if let Some(artifact_id) = self.turn.artifact_id.take() {
            self.ctx.artifacts.delete(&artifact_id);
        }
        let _ = self.ctx.machine.transition(CallState::Listening);
        self.turn = TurnState::idle();
        self.barge.reset();
        self.reset_silence();
    }

    fn finish_turn_to_listening(&mut self) {
        self.response_deadline = None;
        let _ = self.ctx.machine.transition(CallState::Listening);
        self.turn = TurnState::idle();
        self.reset_silence();
    }

    /// Terminal-state guarantees: cancel pending work, end the
    /// conversation, release the port, expire artifacts, drop correlation
    /// state and hang the channel up.
    async fn cleanup(mut self) {
        let record = self.ctx.machine.record().clone();
        let call_id = record.call_id.clone();
        info!(%call_id, state = %record.state, "call cleanup");

        if let Some(correlation) = self.turn.correlation {
            for payload in [Payload::LlmCancel, Payload::TtsCancel] {
                let envelope =
                    Envelope::for_call(payload, call_id.clone()).with_correlation(correlation);
                let _ = self.ctx.bus.publish(envelope).await;
            }
        }

        if let Some(mut conversation) = self.conversation.take() {
            conversation.end();
            self.ctx.stats.record_conversation_ended();
            if let Err(e) = self.ctx.conversations.save(&conversation).await {
                warn!(error = %e, "final conversation save failed");
            }
        }

        let _ = self.ctx.session.egress.send(EgressCommand::Stop).await;
        self.ctx.handle.cancel();

        if let Some(port) = record.local_port {
            self.ctx.ports.release(port);
        }
        self.ctx.artifacts.delete_for_call(&call_id);
        self.ctx.correlation.remove_call(&call_id);

        if let Err(e) = self.ctx.switch.hangup(&record.channel_id).await {
            warn!(error = %e, "hangup failed");
        }

        self.publish_snapshot();
        self.ctx.registry.remove(&call_id);
    }
}
