//! RTP ingress/egress engine
//!
//! Per-call UDP endpoints: packet parsing, per-SSRC stream tracking with
//! loss accounting, a leased port pool, SSRC↔call correlation and the
//! paced egress path.

pub mod correlation;
pub mod packet;
pub mod ports;
pub mod session;
pub mod stream;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RtpError {
    /// Counted and dropped; never fatal for the call
    #[error("malformed RTP packet: {0}")]
    MalformedPacket(String),
    /// Too many SSRCs on one session
    #[error("stream limit exceeded")]
    StreamLimitExceeded,
    /// The port pool is empty; terminal for call creation
    #[error("no RTP ports available")]
    NoPortsAvailable,
    #[error("failed to bind RTP port {port}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

pub use correlation::{ChannelRecord, CorrelationMap};
pub use packet::RtpPacket;
pub use ports::PortPool;
pub use session::{
    derive_ssrc, EgressCommand, RtpSessionConfig, RtpSessionHandle, SessionEvent, SessionStats,
};
pub use stream::{Ingress, RtpStream, StreamStats};
