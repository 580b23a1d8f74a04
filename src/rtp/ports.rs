//! RTP port pool
//!
//! A finite range of UDP ports leased one per call and returned on call
//! termination. The pool is process-global behind a mutex.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, warn};

use super::RtpError;
use crate::types::CallId;

/// Leased port range `[low, high]`
pub struct PortPool {
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    available: Vec<u16>,
    leased: HashMap<u16, CallId>,
}

impl PortPool {
    pub fn new(low: u16, high: u16) -> Self {
        let available: Vec<u16> = (low..=high).rev().collect();
        Self {
            inner: Mutex::new(PoolInner {
                available,
                leased: HashMap::new(),
            }),
        }
    }

    /// Lease a port for a call.
    pub fn lease(&self, call_id: &CallId) -> Result<u16, RtpError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.available.pop() {
            Some(port) => {
                inner.leased.insert(port, call_id.clone());
                debug!(%call_id, port, "leased RTP port");
                Ok(port)
            }
            None => {
                warn!(%call_id, "RTP port pool exhausted");
                Err(RtpError::NoPortsAvailable)
            }
        }
    }

    /// Return a port to the pool. Releasing an unleased port is a no-op.
    pub fn release(&self, port: u16) {
        let mut inner = self.inner.lock().unwrap();
        if inner.leased.remove(&port).is_some() {
            inner.available.push(port);
            debug!(port, "released RTP port");
        }
    }

    /// The call currently holding a port
    pub fn holder(&self, port: u16) -> Option<CallId> {
        self.inner.lock().unwrap().leased.get(&port).cloned()
    }

    pub fn available_count(&self) -> usize {
        self.inner.lock().unwrap().available.len()
    }

    pub fn leased_count(&self) -> usize {
        self.inner.lock().unwrap().leased.len()
    }
}
