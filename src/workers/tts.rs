//! TTS worker
//!
//! Consumes `tts.request`, synthesizes through the configured backend and
//! persists the audio behind an artifact handle with a TTL. Publishes
//! `tts.ready` with the artifact record, or `tts.failed` so the
//! orchestrator can take the fallback path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use super::backend::TtsBackend;
use super::health::{spawn_heartbeat, HealthTracker};
use crate::bus::{Bus, Envelope, Payload, Topic};
use crate::store::ArtifactStore;
use crate::types::CorrelationId;

#[derive(Debug, Clone)]
pub struct TtsWorkerConfig {
    pub parallelism: usize,
    pub request_timeout: Duration,
    pub heartbeat: Duration,
}

impl Default for TtsWorkerConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            request_timeout: Duration::from_secs(20),
            heartbeat: Duration::from_secs(10),
        }
    }
}

type CancelMap = Arc<Mutex<HashMap<CorrelationId, watch::Sender<bool>>>>;

/// Spawn the worker; returns its health tracker
pub fn spawn_tts_worker(
    bus: Arc<Bus>,
    backend: Arc<dyn TtsBackend>,
    artifacts: Arc<ArtifactStore>,
    config: TtsWorkerConfig,
    shutdown: watch::Receiver<bool>,
) -> Arc<HealthTracker> {
    let tracker = HealthTracker::new("tts");
    spawn_heartbeat(
        bus.clone(),
        tracker.clone(),
        config.heartbeat,
        shutdown.clone(),
    );

    let cancels: CancelMap = Arc::new(Mutex::new(HashMap::new()));

    // Cancellation listener
    {
        let cancels = cancels.clone();
        let bus = bus.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut cancel_sub = bus.subscribe(Topic::TtsCancel);
            loop {
                let envelope = tokio::select! {
                    envelope = cancel_sub.recv() => envelope,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                };
                if let Some(correlation_id) = envelope.correlation_id {
                    if let Some(cancel) = cancels.lock().unwrap().remove(&correlation_id) {
                        info!(%correlation_id, "cancelling in-flight synthesis");
                        let _ = cancel.send(true);
                    }
                }
            }
        });
    }

    let worker_tracker = tracker.clone();
    tokio::spawn(async move {
        let mut requests = bus.subscribe(Topic::TtsRequest);
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
                warn!(error = %e, "rejecting tts request");
                continue;
            }
            let Payload::TtsRequest {
                text,
                voice,
                encoding,
                sample_rate,
            } = envelope.payload
            else {
                continue;
            };
            let Some(call_id) = envelope.call_id.clone() else {
                warn!("tts request without call id dropped");
                continue;
            };
            let Some(correlation_id) = envelope.correlation_id else {
                warn!("tts request without correlation id dropped");
                continue;
            };

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let (cancel_tx, mut cancel_rx) = watch::channel(false);
            cancels.lock().unwrap().insert(correlation_id, cancel_tx);

            let bus = bus.clone();
            let backend = backend.clone();
            let artifacts = artifacts.clone();
            let tracker = worker_tracker.clone();
            let timeout = config.request_timeout;
            let cancels = cancels.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                let _ = encoding; // artifacts are persisted as WAV

                let outcome = tokio::select! {
                    result = tokio::time::timeout(
                        timeout,
                        backend.synthesize(&text, &voice, sample_rate),
                    ) => Some(result),
                    _ = cancel_rx.changed() => None,
                };

                cancels.lock().unwrap().remove(&correlation_id);

                let Some(result) = outcome else {
                    debug!(%correlation_id, "synthesis cancelled, publishing nothing");
                    return;
                };

                let payload = match result {
                    Ok(Ok(samples)) => {
                        match artifacts.save_wav(&call_id, &samples, sample_rate) {
                            Ok(artifact) => {
                                tracker.record_success(started.elapsed());
                                debug!(
                                    artifact_id = %artifact.artifact_id,
                                    duration_ms = artifact.duration_ms,
                                    "synthesis complete"
                                );
                                Payload::TtsReady { artifact }
                            }
                            Err(e) => {
                                tracker.record_error();
                                warn!(error = %e, "failed to persist artifact");
                                Payload::TtsFailed {
                                    reason: e.to_string(),
                                }
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        tracker.record_error();
                        warn!(error = %e, "TTS backend failed");
                        Payload::TtsFailed {
                            reason: e.to_string(),
                        }
                    }
                    Err(_) => {
                        tracker.record_error();
                        warn!("TTS backend timed out");
                        Payload::TtsFailed {
                            reason: "synthesis timed out".into(),
                        }
                    }
                };

                let mut result = Envelope::for_call(payload, call_id);
                result.correlation_id = Some(correlation_id);
                if let Err(e) = bus.publish(result).await {
                    warn!(error = %e, "failed to publish tts result");
                }
            });
        }
        debug!("tts worker stopped");
    });

    tracker
}
