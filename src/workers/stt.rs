//! STT worker
//!
//! Consumes `stt.request`, invokes the configured backend with a deadline
//! and publishes `stt.result`. A backend timeout or failure publishes an
//! empty final result — a single STT request is never auto-retried, since
//! a retry would change turn semantics.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};

use super::backend::SttBackend;
use super::health::{spawn_heartbeat, HealthTracker};
use crate::bus::{Bus, Envelope, Payload};

#[derive(Debug, Clone)]
pub struct SttWorkerConfig {
    /// Concurrent transcriptions (model backends are mostly serial)
    pub parallelism: usize,
    pub request_timeout: Duration,
    pub heartbeat: Duration,
}

impl Default for SttWorkerConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            request_timeout: Duration::from_secs(15),
            heartbeat: Duration::from_secs(10),
        }
    }
}

/// Spawn the worker; returns its health tracker
pub fn spawn_stt_worker(
    bus: Arc<Bus>,
    backend: Arc<dyn SttBackend>,
    config: SttWorkerConfig,
    shutdown: watch::Receiver<bool>,
) -> Arc<HealthTracker> {
    let tracker = HealthTracker::new("stt");
    spawn_heartbeat(
        bus.clone(),
        tracker.clone(),
        config.heartbeat,
        shutdown.clone(),
    );

    let worker_tracker = tracker.clone();
    tokio::spawn(async move {
        let mut requests = bus.subscribe(crate::bus::Topic::SttRequest);
        let semaphore = Arc::new(Semaphore::new(config.parallelism));
        let mut shutdown = shutdown;

        loop {
            let envelope = tokio::select! {
                envelope = requests.recv() => envelope,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            if let Err(e) = envelope.check_schema() {
                warn!(error = %e, "rejecting stt request");
                continue;
            }
            let Payload::SttRequest {
                audio,
                sample_rate,
                language,
            } = envelope.payload
            else {
                continue;
            };

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let bus = bus.clone();
            let backend = backend.clone();
            let tracker = worker_tracker.clone();
            let timeout = config.request_timeout;
            let call_id = envelope.call_id.clone();
            let correlation_id = envelope.correlation_id;

            tokio::spawn(async move {
                let _permit = permit;
                let started = Instant::now();

                let outcome = tokio::time::timeout(
                    timeout,
                    backend.transcribe(&audio, sample_rate, &language),
                )
                .await;

                let payload = match outcome {
                    Ok(Ok(transcription)) => {
                        tracker.record_success(started.elapsed());
                        debug!(
                            text = %transcription.text,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "transcription complete"
                        );
                        Payload::SttResult {
                            text: transcription.text,
                            confidence: transcription.confidence,
                            is_final: true,
                        }
                    }
                    Ok(Err(e)) => {
                        tracker.record_error();
                        warn!(error = %e, "STT backend failed, publishing empty result");
                        Payload::SttResult {
                            text: String::new(),
                            confidence: 0.0,
                            is_final: true,
                        }
                    }
                    Err(_) => {
                        tracker.record_error();
                        warn!("STT backend timed out, publishing empty result");
                        Payload::SttResult {
                            text: String::new(),
                            confidence: 0.0,
                            is_final: true,
                        }
                    }
                };

                let mut result = Envelope::new(payload);
                result.call_id = call_id;
                result.correlation_id = correlation_id;
                if let Err(e) = bus.publish(result).await {
                    warn!(error = %e, "failed to publish stt result");
                }
            });
        }
        debug!("stt worker stopped");
    });

    tracker
}
