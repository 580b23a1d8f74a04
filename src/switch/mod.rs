//! Telephony switch interface
//!
//! The switch itself is an external collaborator; this module holds the
//! control client we drive (answer, play, stop, hangup, say) and the
//! event stream we consume (offers, playback completion, hangups, DTMF).

pub mod client;
pub mod events;

pub use client::{HttpSwitchClient, SwitchClientConfig, SwitchControl};
pub use events::{spawn_event_stream, SwitchEvent};
