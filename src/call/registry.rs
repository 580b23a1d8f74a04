//! Call registry
//!
//! Arena of active calls keyed by `CallId`. Components pass IDs around and
//! look calls up here instead of holding references into each other; the
//! registry also feeds the status endpoint with snapshots.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::machine::CallEvent;
use super::state::CallState;
use crate::audio::Codec;
use crate::types::{CallDirection, CallId, ChannelId};

/// Read-only view of a call for the status surface and tests
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub call_id: CallId,
    pub channel_id: ChannelId,
    pub caller_id: Option<String>,
    pub direction: CallDirection,
    pub state: CallState,
    pub codec: Codec,
    pub local_port: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub lost_packets: u64,
}

/// Handle to a live call's event loop
#[derive(Clone)]
pub struct CallHandle {
    pub call_id: CallId,
    pub channel_id: ChannelId,
    events: mpsc::UnboundedSender<CallEvent>,
    cancel: Arc<watch::Sender<bool>>,
    snapshot: Arc<Mutex<CallSnapshot>>,
}

impl CallHandle {
    pub fn new(
        call_id: CallId,
        channel_id: ChannelId,
        events: mpsc::UnboundedSender<CallEvent>,
        cancel: watch::Sender<bool>,
        snapshot: CallSnapshot,
    ) -> Self {
        Self {
            call_id,
            channel_id,
            events,
            cancel: Arc::new(cancel),
            snapshot: Arc::new(Mutex::new(snapshot)),
        }
    }

    /// Enqueue an event on the call's FIFO. Returns false when the call's
    /// consumer is gone.
    pub fn send(&self, event: CallEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Raise the per-call cancellation signal (terminal state entered)
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// A receiver on the cancellation signal for tasks tied to this call
    pub fn cancel_token(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.lock().unwrap().clone()
    }

    pub fn update_snapshot(&self, update: impl FnOnce(&mut CallSnapshot)) {
        let mut snapshot = self.snapshot.lock().unwrap();
        update(&mut snapshot);
    }
}

/// Process-global arena of active calls
pub struct CallRegistry {
    calls: RwLock<HashMap<CallId, CallHandle>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            calls: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, handle: CallHandle) {
        debug!(call_id = %handle.call_id, "call registered");
        self.calls
            .write()
            .unwrap()
            .insert(handle.call_id.clone(), handle);
    }

    pub fn get(&self, call_id: &CallId) -> Option<CallHandle> {
        self.calls.read().unwrap().get(call_id).cloned()
    }

    pub fn by_channel(&self, channel_id: &ChannelId) -> Option<CallHandle> {
        self.calls
            .read()
            .unwrap()
            .values()
            .find(|h| &h.channel_id == channel_id)
            .cloned()
    }

    /// Remove a call once its loop has fully cleaned up
    pub fn remove(&self, call_id: &CallId) -> Option<CallHandle> {
        debug!(%call_id, "call removed from registry");
        self.calls.write().unwrap().remove(call_id)
    }

    pub fn snapshots(&self) -> Vec<CallSnapshot> {
        self.calls
            .read()
            .unwrap()
            .values()
            .map(|h| h.snapshot())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.calls
            .read()
            .unwrap()
            .values()
            .filter(|h| !h.snapshot().state.is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.calls.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.read().unwrap().is_empty()
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str, chan: &str) -> (CallHandle, mpsc::UnboundedReceiver<CallEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        let call_id = CallId::from(id);
        let channel_id = ChannelId::from(chan);
        let snapshot = CallSnapshot {
            call_id: call_id.clone(),
            channel_id: channel_id.clone(),
            caller_id: None,
            direction: CallDirection::Inbound,
            state: CallState::Ringing,
            codec: Codec::Pcmu,
            local_port: Some(10000),
            created_at: Utc::now(),
            last_activity: Utc::now(),
            lost_packets: 0,
        };
        (
            CallHandle::new(call_id, channel_id, tx, cancel_tx, snapshot),
            rx,
        )
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = CallRegistry::new();
        let (h, _rx) = handle("c1", "chan-1");
        registry.insert(h);

        assert!(registry.get(&CallId::from("c1")).is_some());
        assert!(registry.by_channel(&ChannelId::from("chan-1")).is_some());
        assert_eq!(registry.len(), 1);

        registry.remove(&CallId::from("c1"));
        assert!(registry.get(&CallId::from("c1")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_event_send() {
        let registry = CallRegistry::new();
        let (h, mut rx) = handle("c1", "chan-1");
        registry.insert(h);

        let handle = registry.get(&CallId::from("c1")).unwrap();
        assert!(handle.send(CallEvent::Answered));
        assert!(matches!(rx.try_recv(), Ok(CallEvent::Answered)));
    }

    #[test]
    fn test_cancel_signal() {
        let (h, _rx) = handle("c1", "chan-1");
        let mut token = h.cancel_token();
        assert!(!*token.borrow());
        h.cancel();
        assert!(token.has_changed().unwrap());
        assert!(*token.borrow_and_update());
    }

    #[test]
    fn test_snapshot_update() {
        let (h, _rx) = handle("c1", "chan-1");
        h.update_snapshot(|s| s.state = CallState::Listening);
        assert_eq!(h.snapshot().state, CallState::Listening);
    }

    #[test]
    fn test_active_count_excludes_terminal() {
        let registry = CallRegistry::new();
        let (a, _rxa) = handle("a", "chan-a");
        let (b, _rxb) = handle("b", "chan-b");
        b.update_snapshot(|s| s.state = CallState::Ended);
        registry.insert(a);
        registry.insert(b);
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.len(), 2);
    }
}
