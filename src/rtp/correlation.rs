//! SSRC ↔ call correlation
//!
//! Two maps: `ssrc → call_id`, bound on the first packet of an unknown
//! SSRC and permanent for the stream's lifetime, and `call_id → channel
//! record` describing the media endpoint of each active call. Read-heavy:
//! every packet consults the map, writes happen once per stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

use tracing::{debug, info};

use crate::audio::Codec;
use crate::types::{CallId, ChannelId};

/// Media-side record of one call
#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub channel_id: ChannelId,
    pub local_port: u16,
    pub remote: Option<SocketAddr>,
    pub codec: Codec,
    pub ssrc: Option<u32>,
}

/// Process-global correlation state
pub struct CorrelationMap {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_ssrc: HashMap<u32, CallId>,
    by_call: HashMap<CallId, ChannelRecord>,
}

impl CorrelationMap {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Register a call's channel record when its media is allocated
    pub fn register_call(&self, call_id: CallId, record: ChannelRecord) {
        let mut inner = self.inner.write().unwrap();
        debug!(%call_id, port = record.local_port, "registered call media");
        inner.by_call.insert(call_id, record);
    }

    /// Bind an SSRC to a call on its first packet. Idempotent: rebinding
    /// the same SSRC to the same call is a no-op; a conflicting bind is
    /// refused.
    pub fn bind_ssrc(&self, ssrc: u32, call_id: &CallId) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.by_ssrc.get(&ssrc) {
            Some(existing) if existing == call_id => true,
            Some(existing) => {
                info!(
                    ssrc,
                    bound = %existing,
                    refused = %call_id,
                    "SSRC already bound to another call"
                );
                false
            }
            None => {
                inner.by_ssrc.insert(ssrc, call_id.clone());
                if let Some(record) = inner.by_call.get_mut(call_id) {
                    record.ssrc = Some(ssrc);
                }
                info!(ssrc, %call_id, "bound SSRC to call");
                true
            }
        }
    }

    /// Learn the remote media endpoint (symmetric RTP)
    pub fn set_remote(&self, call_id: &CallId, remote: SocketAddr) {
        let mut inner = self.inner.write().unwrap();
        if let Some(record) = inner.by_call.get_mut(call_id) {
            if record.remote.is_none() {
                debug!(%call_id, %remote, "learned remote media endpoint");
            }
            record.remote = Some(remote);
        }
    }

    pub fn call_for_ssrc(&self, ssrc: u32) -> Option<CallId> {
        self.inner.read().unwrap().by_ssrc.get(&ssrc).cloned()
    }

    pub fn record(&self, call_id: &CallId) -> Option<ChannelRecord> {
        self.inner.read().unwrap().by_call.get(call_id).cloned()
    }

    /// Drop all state for a terminated call
    pub fn remove_call(&self, call_id: &CallId) {
        let mut inner = self.inner.write().unwrap();
        inner.by_call.remove(call_id);
        inner.by_ssrc.retain(|_, c| c != call_id);
    }

    pub fn active_calls(&self) -> usize {
        self.inner.read().unwrap().by_call.len()
    }
}

impl Default for CorrelationMap {
    fn default() -> Self {
        Self::new()
    }
}
