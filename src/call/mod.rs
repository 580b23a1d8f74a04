//! Call control plane
//!
//! One finite-state machine per call with a single-consumer event FIFO,
//! per-call instructions, and the registry arena that the rest of the
//! system uses to reach a call by ID.

pub mod instructions;
pub mod machine;
pub mod registry;
pub mod state;

pub use instructions::CallInstructions;
pub use machine::{CallEvent, CallRecord, CallStateMachine, TransitionError};
pub use registry::{CallHandle, CallRegistry, CallSnapshot};
pub use state::CallState;
