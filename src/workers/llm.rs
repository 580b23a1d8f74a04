//! LLM worker
//!
//! Consumes `llm.request`, drives the primary model and falls back to a
//! second model when the failure class allows it. Streaming deltas go out
//! as `llm.response.partial` followed by the final `llm.response`.
//! `llm.cancel` aborts the in-flight call for a correlation ID; a
//! cancelled turn publishes nothing (late results are discarded by the
//! orchestrator anyway).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use super::backend::{Completion, LlmBackend};
use super::health::{spawn_heartbeat, HealthTracker};
use crate::bus::{Bus, Envelope, Payload, Topic};
use crate::types::{ChatMessage, CorrelationId};

#[derive(Debug, Clone)]
pub struct LlmWorkerConfig {
    pub parallelism: usize,
    pub request_timeout: Duration,
    pub heartbeat: Duration,
    pub primary_model: String,
    pub fallback_model: Option<String>,
    /// Emit llm.response.partial deltas while the model streams
    pub streaming: bool,
}

impl Default for LlmWorkerConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            request_timeout: Duration::from_secs(30),
            heartbeat: Duration::from_secs(10),
            primary_model: "primary".into(),
            fallback_model: None,
            streaming: false,
        }
    }
}

/// Failure classes used for the failover decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmFailure {
    RateLimit,
    ModelDown,
    Timeout,
    Auth,
    Other,
}

/// Classify a backend error message
pub fn classify_error(error: &str) -> LlmFailure {
    let lower = error.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
    {
        LlmFailure::RateLimit
    } else if lower.contains("502")
        || lower.contains("503")
        || lower.contains("unavailable")
        || lower.contains("overloaded")
    {
        LlmFailure::ModelDown
    } else if lower.contains("timed out") || lower.contains("timeout") {
        LlmFailure::Timeout
    } else if lower.contains("401") || lower.contains("403") || lower.contains("unauthorized") {
        LlmFailure::Auth
    } else {
        LlmFailure::Other
    }
}

/// Whether the fallback model is worth trying for this failure
pub fn should_failover(failure: &LlmFailure) -> bool {
    !matches!(failure, LlmFailure::Auth)
}

type CancelMap = Arc<Mutex<HashMap<CorrelationId, watch::Sender<bool>>>>;

/// Spawn the worker; returns its health tracker
pub fn spawn_llm_worker(
    bus: Arc<Bus>,
    backend: Arc<dyn LlmBackend>,
    config: LlmWorkerConfig,
    shutdown: watch::Receiver<bool>,
) -> Arc<HealthTracker> {
    let tracker = HealthTracker::new("llm");
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
            let mut cancel_sub = bus.subscribe(Topic::LlmCancel);
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
                        info!(%correlation_id, "cancelling in-flight LLM call");
                        let _ = cancel.send(true);
                    }
                }
            }
        });
    }

    let worker_tracker = tracker.clone();
    tokio::spawn(async move {
        let mut requests = bus.subscribe(Topic::LlmRequest);
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
                warn!(error = %e, "rejecting llm request");
                continue;
            }
            let Payload::LlmRequest {
                messages,
                max_tokens,
                temperature,
            } = envelope.payload
            else {
                continue;
            };
            let Some(correlation_id) = envelope.correlation_id else {
                warn!("llm request without correlation id dropped");
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
            let tracker = worker_tracker.clone();
            let config = config.clone();
            let cancels = cancels.clone();
            let call_id = envelope.call_id.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                let meta = EnvelopeMeta {
                    call_id: call_id.clone(),
                    correlation_id,
                };

                let outcome = tokio::select! {
                    result = run_with_fallback(
                        &*backend,
                        &config,
                        &bus,
                        &meta,
                        &messages,
                        max_tokens,
                        temperature,
                    ) => Some(result),
                    _ = cancel_rx.changed() => None,
                };

                cancels.lock().unwrap().remove(&correlation_id);

                let Some(result) = outcome else {
                    debug!(%correlation_id, "LLM turn cancelled, publishing nothing");
                    return;
                };

                let payload = match result {
                    Ok(completion) => {
                        tracker.record_success(started.elapsed());
                        Payload::LlmResponse {
                            text: completion.text,
                            prompt_tokens: completion.prompt_tokens,
                            completion_tokens: completion.completion_tokens,
                        }
                    }
                    Err(e) => {
                        tracker.record_error();
                        warn!(error = %e, "LLM failed after fallback");
                        Payload::LlmError {
                            reason: e.to_string(),
                        }
                    }
                };

                let mut result = Envelope::new(payload);
                result.call_id = call_id;
                result.correlation_id = Some(correlation_id);
                if let Err(e) = bus.publish(result).await {
                    warn!(error = %e, "failed to publish llm result");
                }
            });
        }
        debug!("llm worker stopped");
    });

    tracker
}

struct EnvelopeMeta {
    call_id: Option<crate::types::CallId>,
    correlation_id: CorrelationId,
}

/// Primary model, then the fallback when the failure class allows
async fn run_with_fallback(
    backend: &dyn LlmBackend,
    config: &LlmWorkerConfig,
    bus: &Arc<Bus>,
    meta: &EnvelopeMeta,
    messages: &[ChatMessage],
    max_tokens: u32,
    temperature: f32,
) -> Result<Completion> {
    match attempt(backend, config, bus, meta, &config.primary_model, messages, max_tokens, temperature)
        .await
    {
        Ok(completion) => Ok(completion),
        Err(primary_err) => {
            let failure = classify_error(&primary_err.to_string());
            match &config.fallback_model {
                Some(fallback) if should_failover(&failure) => {
                    warn!(
                        primary = %config.primary_model,
                        %fallback,
                        failure = ?failure,
                        "primary model failed, trying fallback"
                    );
                    attempt(backend, config, bus, meta, fallback, messages, max_tokens, temperature)
                        .await
                        .map_err(|fallback_err| {
                            primary_err.context(format!("fallback also failed: {fallback_err}"))
                        })
                }
                _ => Err(primary_err),
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn attempt(
    backend: &dyn LlmBackend,
    config: &LlmWorkerConfig,
    bus: &Arc<Bus>,
    meta: &EnvelopeMeta,
    model: &str,
    messages: &[ChatMessage],
    max_tokens: u32,
    temperature: f32,
) -> Result<Completion> {
    let deltas = if config.streaming {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let bus = bus.clone();
        let call_id = meta.call_id.clone();
        let correlation_id = meta.correlation_id;
        tokio::spawn(async move {
            while let Some(delta) = rx.recv().await {
                let mut envelope = Envelope::new(Payload::LlmPartial { delta });
                envelope.call_id = call_id.clone();
                envelope.correlation_id = Some(correlation_id);
                let _ = bus.publish(envelope).await;
            }
        });
        Some(tx)
    } else {
        None
    };

    tokio::time::timeout(
        config.request_timeout,
        backend.complete(model, messages, max_tokens, temperature, deltas),
    )
    .await
    .map_err(|_| anyhow::anyhow!("LLM request timed out after {:?}", config.request_timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CallId;
    use async_trait::async_trait;

    /// Fails for one model id, succeeds for every other
    struct FlakyBackend {
        bad_model: String,
        error: String,
    }

    #[async_trait]
    impl LlmBackend for FlakyBackend {
        async fn complete(
            &self,
            model: &str,
            _messages: &[ChatMessage],
            _max_tokens: u32,
            _temperature: f32,
            _deltas: Option<mpsc::UnboundedSender<String>>,
        ) -> Result<Completion> {
            if model == self.bad_model {
                anyhow::bail!("{}", self.error);
            }
            Ok(Completion {
                text: format!("answer from {model}"),
                prompt_tokens: 10,
                completion_tokens: 5,
            })
        }
    }

    struct HangingBackend;

    #[async_trait]
    impl LlmBackend for HangingBackend {
        async fn complete(
            &self,
            _: &str,
            _: &[ChatMessage],
            _: u32,
            _: f32,
            _: Option<mpsc::UnboundedSender<String>>,
        ) -> Result<Completion> {
            tokio::time::sleep(Duration::from_secs(120)).await;
            unreachable!()
        }
    }

    fn request(call: &str, correlation: CorrelationId) -> Envelope {
        let mut envelope = Envelope::for_call(
            Payload::LlmRequest {
                messages: vec![ChatMessage::user("hello")],
                max_tokens: 128,
                temperature: 0.7,
            },
            CallId::from(call),
        );
        envelope.correlation_id = Some(correlation);
        envelope
    }

    #[test]
    fn test_classify_and_failover() {
        assert_eq!(classify_error("HTTP 429 Too Many Requests"), LlmFailure::RateLimit);
        assert_eq!(classify_error("503 service unavailable"), LlmFailure::ModelDown);
        assert_eq!(classify_error("request timed out"), LlmFailure::Timeout);
        assert_eq!(classify_error("401 unauthorized"), LlmFailure::Auth);
        assert!(should_failover(&LlmFailure::RateLimit));
        assert!(should_failover(&LlmFailure::Other));
        assert!(!should_failover(&LlmFailure::Auth));
    }

    #[tokio::test]
    async fn test_fallback_model_used() {
        let bus = Arc::new(Bus::new());
        let mut responses = bus.subscribe(Topic::LlmResponse);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        spawn_llm_worker(
            bus.clone(),
            Arc::new(FlakyBackend {
                bad_model: "primary".into(),
                error: "503 service unavailable".into(),
            }),
            LlmWorkerConfig {
                primary_model: "primary".into(),
                fallback_model: Some("backup".into()),
                ..Default::default()
            },
            shutdown_rx,
        );

        bus.publish(request("c1", uuid::Uuid::new_v4())).await.unwrap();
        let response = responses.recv().await;
        match response.payload {
            Payload::LlmResponse { text, .. } => assert_eq!(text, "answer from backup"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_error_published_when_all_fail() {
        let bus = Arc::new(Bus::new());
        let mut errors = bus.subscribe(Topic::LlmError);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        spawn_llm_worker(
            bus.clone(),
            Arc::new(FlakyBackend {
                bad_model: "only".into(),
                error: "503 unavailable".into(),
            }),
            LlmWorkerConfig {
                primary_model: "only".into(),
                fallback_model: None,
                ..Default::default()
            },
            shutdown_rx,
        );

        bus.publish(request("c1", uuid::Uuid::new_v4())).await.unwrap();
        let error = errors.recv().await;
        assert!(matches!(error.payload, Payload::LlmError { .. }));
    }

    #[tokio::test]
    async fn test_cancel_suppresses_response() {
        let bus = Arc::new(Bus::new());
        let mut responses = bus.subscribe(Topic::LlmResponse);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        spawn_llm_worker(
            bus.clone(),
            Arc::new(HangingBackend),
            LlmWorkerConfig::default(),
            shutdown_rx,
        );

        let correlation = uuid::Uuid::new_v4();
        bus.publish(request("c1", correlation)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut cancel = Envelope::for_call(Payload::LlmCancel, CallId::from("c1"));
        cancel.correlation_id = Some(correlation);
        bus.publish(cancel).await.unwrap();

        // No response should arrive
        let got = tokio::time::timeout(Duration::from_millis(300), responses.recv()).await;
        assert!(got.is_err(), "cancelled turn must not publish a response");
    }

    #[tokio::test]
    async fn test_streaming_emits_partials() {
        let bus = Arc::new(Bus::new());
        let mut partials = bus.subscribe(Topic::LlmPartial);
        let mut responses = bus.subscribe(Topic::LlmResponse);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        spawn_llm_worker(
            bus.clone(),
            Arc::new(crate::workers::backend::StaticLlmBackend),
            LlmWorkerConfig {
                streaming: true,
                ..Default::default()
            },
            shutdown_rx,
        );

        bus.publish(request("c1", uuid::Uuid::new_v4())).await.unwrap();
        let partial = partials.recv().await;
        assert!(matches!(partial.payload, Payload::LlmPartial { .. }));
        let response = responses.recv().await;
        assert!(matches!(response.payload, Payload::LlmResponse { .. }));
    }
}
