//! Voicebridge - real-time voice agent platform
//!
//! Bridges a telephony switch's external-media interface to a
//! speech-recognition → language-model → speech-synthesis pipeline so a
//! caller and a machine can hold a spoken dialogue. The crate covers the
//! real-time media and conversation control plane:
//!
//! - per-call RTP ingress/egress with codec handling and loss accounting
//! - the audio conditioning pipeline (echo, noise, VAD, utterances)
//! - one state machine per call with a single-consumer event FIFO
//! - the conversation orchestrator coupling calls to the model workers
//! - the typed message bus the workers and controller share
//!
//! The switch itself and the concrete model runtimes stay external; this
//! crate consumes their interfaces.

// Media plane
pub mod audio;
pub mod pipeline;
pub mod rtp;

// Control plane
pub mod call;
pub mod conversation;
pub mod orchestrator;

// Fabric and workers
pub mod bus;
pub mod workers;

// External collaborators and persistence
pub mod store;
pub mod switch;

// Application surface
pub mod cli;
pub mod config;
pub mod engine;
pub mod server;
pub mod stats;
pub mod types;

// Re-export the types most integrations need
pub use audio::Codec;
pub use bus::{Bus, Envelope, Payload, Topic};
pub use call::{CallEvent, CallRegistry, CallState};
pub use config::Config;
pub use conversation::Conversation;
pub use engine::Engine;
pub use stats::EngineStats;
pub use types::{CallId, ChannelId, CorrelationId, Utterance};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
