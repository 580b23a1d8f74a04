//! Worker health reporting
//!
//! Each worker keeps a small latency/error tracker and publishes a
//! periodic `health.<worker>` event on the bus.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::error;

use crate::bus::{Bus, Envelope, HealthReport, HealthStatus, Payload};

/// Latency samples kept for the percentile estimates
const LATENCY_WINDOW: usize = 256;

/// Error-rate threshold beyond which a worker reports Degraded
const DEGRADED_ERROR_RATE: f32 = 0.1;

/// Shared request/latency tracker for one worker
pub struct HealthTracker {
    worker: String,
    started: Instant,
    requests: AtomicU64,
    errors: AtomicU64,
    latencies_ms: Mutex<Vec<f64>>,
}

impl HealthTracker {
    pub fn new(worker: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            worker: worker.into(),
            started: Instant::now(),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latencies_ms: Mutex::new(Vec::with_capacity(LATENCY_WINDOW)),
        })
    }

    pub fn record_success(&self, latency: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let mut latencies = self.latencies_ms.lock().unwrap();
        if latencies.len() == LATENCY_WINDOW {
            latencies.remove(0);
        }
        latencies.push(latency.as_secs_f64() * 1000.0);
    }

    pub fn record_error(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn percentile(sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let rank = (p * (sorted.len() - 1) as f64).round() as usize;
        sorted[rank.min(sorted.len() - 1)]
    }

    /// Snapshot the current health
    pub fn report(&self, queue_depth: usize) -> HealthReport {
        let requests = self.requests.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let error_rate = if requests == 0 {
            0.0
        } else {
            errors as f32 / requests as f32
        };

        let mut latencies = self.latencies_ms.lock().unwrap().clone();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let status = if error_rate > DEGRADED_ERROR_RATE {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            worker: self.worker.clone(),
            status,
            uptime_s: self.started.elapsed().as_secs(),
            queue_depth,
            error_rate,
            backend_latency_ms_p50: Self::percentile(&latencies, 0.50),
            backend_latency_ms_p95: Self::percentile(&latencies, 0.95),
        }
    }
}

/// Publish a worker's health on an interval until shutdown
pub fn spawn_heartbeat(
    bus: Arc<Bus>,
    tracker: Arc<HealthTracker>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = tracker.report(0);
                    if let Err(e) = bus
                        .publish(Envelope::new(Payload::Health(report)))
                        .await
                    {
                        error!(error = %e, "health publish failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}
