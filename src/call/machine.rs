//! Per-call state machine
//!
//! Owns the canonical call record and validates every transition against
//! the table in `state.rs`. All events for a call flow through one
//! unbounded FIFO consumed by a single task (the orchestrator's call
//! loop), which makes transitions totally ordered without any locking on
//! call state.
//!
//! Handlers registered per state or per transition fire after the
//! canonical update; a failing handler is logged and isolated, it cannot
//! corrupt the state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use super::instructions::CallInstructions;
use super::state::CallState;
use crate::audio::Codec;
use crate::bus::ControlAction;
use crate::store::artifacts::TtsArtifact;
use crate::types::{CallDirection, CallId, ChannelId, CorrelationId, Utterance};

/// Everything a call's event loop can receive, in FIFO order
#[derive(Debug)]
pub enum CallEvent {
    /// Switch answered the call
    Answered,
    /// First media packet bound; the call can listen
    MediaBound,
    /// Pipeline: utterance opened
    SpeechStarted,
    /// Pipeline: one speech frame inside an open utterance
    SpeechFrame { confidence: f32 },
    /// Pipeline: utterance closed
    SpeechEnded,
    /// Pipeline: a complete utterance
    UtteranceReady(Utterance),
    /// Pipeline stage failure; fatal for the call
    PipelineFailed(String),
    /// STT worker result
    SttResult {
        correlation_id: CorrelationId,
        text: String,
        confidence: f32,
        is_final: bool,
    },
    /// LLM streaming delta
    LlmPartial {
        correlation_id: CorrelationId,
        delta: String,
    },
    /// LLM final response
    LlmResponse {
        correlation_id: CorrelationId,
        text: String,
    },
    /// LLM failed after the fallback model
    LlmFailed {
        correlation_id: CorrelationId,
        reason: String,
    },
    /// TTS artifact ready for playback
    TtsReady {
        correlation_id: CorrelationId,
        artifact: TtsArtifact,
    },
    /// TTS failed; take the fallback path
    TtsFailed {
        correlation_id: CorrelationId,
        reason: String,
    },
    /// Switch finished playing the artifact
    PlaybackFinished,
    /// Our own egress stream drained
    EgressFinished,
    /// DTMF digit from the switch (hook; surfaced into metadata)
    Dtmf { digit: char },
    /// Out-of-band control action from the bus
    Control(ControlAction),
    /// Hangup, by the caller or by us
    Hangup,
    /// Replace the per-call instructions
    UpdateInstructions(Box<CallInstructions>),
    /// Timer: continuous silence exceeded the limit
    SilenceTimeout,
    /// Timer: the call hit its maximum duration
    MaxDurationReached,
    /// Timer: no model response within the response window
    ResponseTimeout,
    /// Fatal component failure
    Fatal(String),
}

#[derive(Debug, Error)]
#[error("invalid transition {from} -> {to}")]
pub struct TransitionError {
    pub from: CallState,
    pub to: CallState,
}

/// The canonical mutable record of one call
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub call_id: CallId,
    pub channel_id: ChannelId,
    pub caller_id: Option<String>,
    pub direction: CallDirection,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub local_port: Option<u16>,
    pub codec: Codec,
    pub instructions: CallInstructions,
    pub error_message: Option<String>,
}

impl CallRecord {
    pub fn new(
        call_id: CallId,
        channel_id: ChannelId,
        caller_id: Option<String>,
        direction: CallDirection,
        codec: Codec,
        instructions: CallInstructions,
    ) -> Self {
        let now = Utc::now();
        Self {
            call_id,
            channel_id,
            caller_id,
            direction,
            state: CallState::Ringing,
            created_at: now,
            updated_at: now,
            last_activity: now,
            local_port: None,
            codec,
            instructions,
            error_message: None,
        }
    }
}

type Handler = Box<dyn Fn(&CallRecord) + Send + Sync>;

/// State machine for one call
pub struct CallStateMachine {
    record: CallRecord,
    state_handlers: HashMap<CallState, Vec<Handler>>,
    transition_handlers: HashMap<(CallState, CallState), Vec<Handler>>,
    transitions_applied: u64,
    transitions_rejected: u64,
}

impl CallStateMachine {
    pub fn new(record: CallRecord) -> Self {
        Self {
            record,
            state_handlers: HashMap::new(),
            transition_handlers: HashMap::new(),
            transitions_applied: 0,
            transitions_rejected: 0,
        }
    }

    pub fn record(&self) -> &CallRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut CallRecord {
        &mut self.record
    }

    pub fn state(&self) -> CallState {
        self.record.state
    }

    pub fn transitions_rejected(&self) -> u64 {
        self.transitions_rejected
    }

    /// Register a handler fired whenever the given state is entered
    pub fn on_state<F>(&mut self, state: CallState, handler: F)
    where
        F: Fn(&CallRecord) + Send + Sync + 'static,
    {
        self.state_handlers
            .entry(state)
            .or_default()
            .push(Box::new(handler));
    }

    /// Register a handler fired on a specific transition
    pub fn on_transition<F>(&mut self, from: CallState, to: CallState, handler: F)
    where
        F: Fn(&CallRecord) + Send + Sync + 'static,
    {
        self.transition_handlers
            .entry((from, to))
            .or_default()
            .push(Box::new(handler));
    }

    /// Attempt a transition. Rejections are logged and leave the record
    /// untouched.
    pub fn transition(&mut self, to: CallState) -> Result<(), TransitionError> {
        let from = self.record.state;

        if !CallState::can_transition(from, to) {
            self.transitions_rejected += 1;
            warn!(
                call_id = %self.record.call_id,
                %from,
                %to,
                "rejected invalid transition"
            );
            return Err(TransitionError { from, to });
        }

        self.record.state = to;
        self.record.updated_at = Utc::now();
        if matches!(
            to,
            CallState::Listening | CallState::Processing | CallState::Speaking
        ) {
            self.record.last_activity = self.record.updated_at;
        }
        self.transitions_applied += 1;

        info!(call_id = %self.record.call_id, %from, %to, "call transition");

        self.fire(&(from, to));
        self.fire_state(to);
        Ok(())
    }

    /// Transition into ERROR with a message; used for fatal failures
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.record.error_message = Some(message.into());
        self.transition(CallState::Error)
    }

    /// Touch the activity clock (speech frames, DTMF)
    pub fn touch_activity(&mut self) {
        self.record.last_activity = Utc::now();
    }

    fn fire(&self, key: &(CallState, CallState)) {
        if let Some(handlers) = self.transition_handlers.get(key) {
            for handler in handlers {
                // Handler panics would poison the call loop; catch and log
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    handler(&self.record)
                }))
                .is_err()
                {
                    error!(
                        call_id = %self.record.call_id,
                        from = %key.0,
                        to = %key.1,
                        "transition handler panicked"
                    );
                }
            }
        }
    }

    fn fire_state(&self, state: CallState) {
        if let Some(handlers) = self.state_handlers.get(&state) {
            for handler in handlers {
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    handler(&self.record)
                }))
                .is_err()
                {
                    error!(
                        call_id = %self.record.call_id,
                        %state,
                        "state handler panicked"
                    );
                }
            }
        }
    }
}
