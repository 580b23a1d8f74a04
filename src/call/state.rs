//! Call states and the transition table
//!
//! The state machine is the single authority on what a call may do next;
//! every other component asks it. Invalid transitions are rejected and
//! logged, never applied.

use serde::{Deserialize, Serialize};

/// Lifecycle states of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Call received, not yet answered
    Ringing,
    /// Answered, media being established
    Connected,
    /// Waiting for user speech
    Listening,
    /// Processing user input (STT/LLM/TTS in flight)
    Processing,
    /// Agent audio is playing
    Speaking,
    /// User interrupted agent speech
    BargingIn,
    /// Call is being handed off (hook only; execution is external)
    Transferring,
    /// Terminated normally
    Ended,
    /// Terminated by a timeout
    Timeout,
    /// Terminated by a fatal error
    Error,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Timeout | CallState::Error)
    }

    /// Whether `from → to` is a valid transition.
    pub fn can_transition(from: CallState, to: CallState) -> bool {
        use CallState::*;

        // Any non-terminal state may end, time out or fail
        if !from.is_terminal() && matches!(to, Ended | Timeout | Error) {
            return true;
        }

        matches!(
            (from, to),
            (Ringing, Connected)
                | (Connected, Listening)
                | (Listening, Processing)
                | (Processing, Speaking)
                | (Processing, Listening)
                | (Speaking, BargingIn)
                | (Speaking, Listening)
                | (BargingIn, Listening)
                | (Listening, Transferring)
                | (Processing, Transferring)
                | (Speaking, Transferring)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Ringing => "ringing",
            CallState::Connected => "connected",
            CallState::Listening => "listening",
            CallState::Processing => "processing",
            CallState::Speaking => "speaking",
            CallState::BargingIn => "barging_in",
            CallState::Transferring => "transferring",
            CallState::Ended => "ended",
            CallState::Timeout => "timeout",
            CallState::Error => "error",
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CallState::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [Ringing, Connected, Listening, Processing, Speaking, Listening];
        for pair in path.windows(2) {
            assert!(
                CallState::can_transition(pair[0], pair[1]),
                "{} -> {} should be valid",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_barge_in_path() {
        assert!(CallState::can_transition(Speaking, BargingIn));
        assert!(CallState::can_transition(BargingIn, Listening));
        assert!(!CallState::can_transition(BargingIn, Speaking));
    }

    #[test]
    fn test_any_non_terminal_can_end() {
        for state in [
            Ringing, Connected, Listening, Processing, Speaking, BargingIn, Transferring,
        ] {
            assert!(CallState::can_transition(state, Ended));
            assert!(CallState::can_transition(state, Timeout));
            assert!(CallState::can_transition(state, Error));
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [Ended, Timeout, Error] {
            assert!(terminal.is_terminal());
            for target in [
                Ringing, Connected, Listening, Processing, Speaking, BargingIn, Transferring,
                Ended, Timeout, Error,
            ] {
                assert!(
                    !CallState::can_transition(terminal, target),
                    "{terminal} -> {target} must be rejected"
                );
            }
        }
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        assert!(!CallState::can_transition(Ringing, Listening));
        assert!(!CallState::can_transition(Listening, Speaking));
        assert!(!CallState::can_transition(Connected, Processing));
        assert!(!CallState::can_transition(Listening, Connected));
        assert!(!CallState::can_transition(Speaking, Processing));
    }
}
