//! Inter-service message bus
//!
//! Typed publish/subscribe fabric between the call controller and the
//! model-service workers. Delivery is at-least-once and ordered within a
//! `(topic, call_id)` pair; consumers are idempotent on `correlation_id`.
//! Large audio never crosses the bus by value — TTS artifacts travel as
//! handles.
//!
//! Each subscriber owns a bounded inbox. On overflow the bus either drops
//! the oldest message (control topics) or holds the publisher with a
//! retry/backoff window (audio-critical topics).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::store::artifacts::TtsArtifact;
use crate::types::{CallId, ChatMessage, CorrelationId};

/// Current envelope schema version. Consumers reject envelopes from an
/// incompatible (newer) major version.
pub const SCHEMA_VERSION: u32 = 2;

/// Default bounded-inbox capacity per subscriber
pub const DEFAULT_INBOX_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("subscriber inbox full on topic {0}")]
    SubscriberFull(Topic),
    #[error("incompatible schema version {observed} (supported {supported})")]
    IncompatibleSchema { observed: u32, supported: u32 },
}

/// Bus topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    SttRequest,
    SttPartial,
    SttResult,
    LlmRequest,
    LlmPartial,
    LlmResponse,
    LlmError,
    LlmCancel,
    TtsRequest,
    TtsReady,
    TtsFailed,
    TtsCancel,
    BargeIn,
    CallControl,
    Health,
}

/// What to do when a subscriber inbox is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Shed the oldest queued message
    DropOldest,
    /// Hold the publisher inside the retry window
    Block,
}

impl Topic {
    /// Audio-critical requests hold the publisher; control chatter sheds
    /// oldest-first.
    pub fn overflow_policy(&self) -> OverflowPolicy {
        match self {
            Topic::SttRequest
            | Topic::SttResult
            | Topic::LlmRequest
            | Topic::LlmResponse
            | Topic::TtsRequest
            | Topic::TtsReady => OverflowPolicy::Block,
            _ => OverflowPolicy::DropOldest,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::SttRequest => "stt.request",
            Topic::SttPartial => "stt.partial",
            Topic::SttResult => "stt.result",
            Topic::LlmRequest => "llm.request",
            Topic::LlmPartial => "llm.response.partial",
            Topic::LlmResponse => "llm.response",
            Topic::LlmError => "llm.error",
            Topic::LlmCancel => "llm.cancel",
            Topic::TtsRequest => "tts.request",
            Topic::TtsReady => "tts.ready",
            Topic::TtsFailed => "tts.failed",
            Topic::TtsCancel => "tts.cancel",
            Topic::BargeIn => "call.barge_in",
            Topic::CallControl => "call.control",
            Topic::Health => "health",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Out-of-band control actions toward the switch side
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ControlAction {
    PlayAudio { handle: String },
    StopAudio,
    EndConversation,
    GenerateResponse { text: String },
}

/// Worker liveness report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub worker: String,
    pub status: HealthStatus,
    pub uptime_s: u64,
    pub queue_depth: usize,
    pub error_rate: f32,
    pub backend_latency_ms_p50: f64,
    pub backend_latency_ms_p95: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Typed payloads; the topic is derived from the variant
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Payload {
    SttRequest {
        audio: Vec<u8>,
        sample_rate: u32,
        language: String,
    },
    SttPartial {
        text: String,
    },
    SttResult {
        text: String,
        confidence: f32,
        is_final: bool,
    },
    LlmRequest {
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        temperature: f32,
    },
    LlmPartial {
        delta: String,
    },
    LlmResponse {
        text: String,
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    LlmError {
        reason: String,
    },
    LlmCancel,
    TtsRequest {
        text: String,
        voice: String,
        encoding: String,
        sample_rate: u32,
    },
    TtsReady {
        artifact: TtsArtifact,
    },
    TtsFailed {
        reason: String,
    },
    TtsCancel,
    BargeIn {
        confidence: f32,
    },
    CallControl(ControlAction),
    Health(HealthReport),
}

impl Payload {
    pub fn topic(&self) -> Topic {
        match self {
            Payload::SttRequest { .. } => Topic::SttRequest,
            Payload::SttPartial { .. } => Topic::SttPartial,
            Payload::SttResult { .. } => Topic::SttResult,
            Payload::LlmRequest { .. } => Topic::LlmRequest,
            Payload::LlmPartial { .. } => Topic::LlmPartial,
            Payload::LlmResponse { .. } => Topic::LlmResponse,
            Payload::LlmError { .. } => Topic::LlmError,
            Payload::LlmCancel => Topic::LlmCancel,
            Payload::TtsRequest { .. } => Topic::TtsRequest,
            Payload::TtsReady { .. } => Topic::TtsReady,
            Payload::TtsFailed { .. } => Topic::TtsFailed,
            Payload::TtsCancel => Topic::TtsCancel,
            Payload::BargeIn { .. } => Topic::BargeIn,
            Payload::CallControl(_) => Topic::CallControl,
            Payload::Health(_) => Topic::Health,
        }
    }
}

/// The envelope every message travels in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: Topic,
    pub schema_version: u32,
    pub call_id: Option<CallId>,
    pub conversation_id: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    pub created_at: DateTime<Utc>,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self {
            topic: payload.topic(),
            schema_version: SCHEMA_VERSION,
            call_id: None,
            conversation_id: None,
            correlation_id: None,
            created_at: Utc::now(),
            payload,
        }
    }

    pub fn for_call(payload: Payload, call_id: CallId) -> Self {
        let mut envelope = Self::new(payload);
        envelope.call_id = Some(call_id);
        envelope
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Reject envelopes from an incompatible (newer) schema
    pub fn check_schema(&self) -> Result<(), BusError> {
        if self.schema_version > SCHEMA_VERSION {
            return Err(BusError::IncompatibleSchema {
                observed: self.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        Ok(())
    }
}

struct Inbox {
    topic: Topic,
    queue: Mutex<VecDeque<Envelope>>,
    capacity: usize,
    message_ready: Notify,
    space_freed: Notify,
    closed: AtomicBool,
    dropped: Mutex<u64>,
}

impl Inbox {
    fn new(topic: Topic, capacity: usize) -> Self {
        Self {
            topic,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            message_ready: Notify::new(),
            space_freed: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: Mutex::new(0),
        }
    }

    /// Non-blocking offer; applies DropOldest shedding when allowed
    fn try_offer(&self, envelope: Envelope, policy: OverflowPolicy) -> Result<(), Envelope> {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            match policy {
                OverflowPolicy::DropOldest => {
                    queue.pop_front();
                    *self.dropped.lock().unwrap() += 1;
                    warn!(topic = %self.topic, "inbox full, dropped oldest message");
                }
                OverflowPolicy::Block => return Err(envelope),
            }
        }
        queue.push_back(envelope);
        drop(queue);
        self.message_ready.notify_one();
        Ok(())
    }

    fn pop(&self) -> Option<Envelope> {
        let envelope = self.queue.lock().unwrap().pop_front();
        if envelope.is_some() {
            self.space_freed.notify_one();
        }
        envelope
    }
}

/// A subscription: one bounded inbox consumed by a single task
pub struct Subscription {
    inbox: Arc<Inbox>,
}

impl Subscription {
    /// Await the next envelope
    pub async fn recv(&mut self) -> Envelope {
        loop {
            if let Some(envelope) = self.inbox.pop() {
                return envelope;
            }
            self.inbox.message_ready.notified().await;
        }
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.inbox.pop()
    }

    pub fn depth(&self) -> usize {
        self.inbox.queue.lock().unwrap().len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inbox.closed.store(true, Ordering::SeqCst);
    }
}

/// Multi-producer/multi-consumer bus
pub struct Bus {
    subscribers: Mutex<Vec<Arc<Inbox>>>,
    inbox_capacity: usize,
    retry_base: Duration,
    retry_attempts: u32,
}

impl Bus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INBOX_CAPACITY)
    }

    pub fn with_capacity(inbox_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            inbox_capacity,
            retry_base: Duration::from_secs(1),
            retry_attempts: 3,
        }
    }

    /// Subscribe to one topic
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let inbox = Arc::new(Inbox::new(topic, self.inbox_capacity));
        self.subscribers.lock().unwrap().push(inbox.clone());
        debug!(%topic, "new bus subscription");
        Subscription { inbox }
    }

    /// Publish an envelope to every subscriber of its topic. Blocked
    /// publishers retry with exponential backoff inside a bounded window,
    /// then surface `SubscriberFull`.
    pub async fn publish(&self, envelope: Envelope) -> Result<(), BusError> {
        let topic = envelope.topic;
        let policy = topic.overflow_policy();

        let targets: Vec<Arc<Inbox>> = {
            let mut subscribers = self.subscribers.lock().unwrap();
            subscribers.retain(|inbox| !inbox.closed.load(Ordering::SeqCst));
            subscribers
                .iter()
                .filter(|inbox| inbox.topic == topic)
                .cloned()
                .collect()
        };

        for inbox in targets {
            let mut pending = envelope.clone();
            let mut attempt = 0u32;
            loop {
                match inbox.try_offer(pending, policy) {
                    Ok(()) => break,
                    Err(back) => {
                        attempt += 1;
                        if attempt >= self.retry_attempts {
                            warn!(%topic, "publish gave up after {attempt} attempts");
                            return Err(BusError::SubscriberFull(topic));
                        }
                        pending = back;
                        let backoff = self.retry_base * 2u32.pow(attempt - 1);
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = inbox.space_freed.notified() => {}
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Number of live subscriptions (for the status surface)
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|inbox| !inbox.closed.load(Ordering::SeqCst));
        subscribers.len()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stt_result(call: &str, text: &str) -> Envelope {
        Envelope::for_call(
            Payload::SttResult {
                text: text.into(),
                confidence: 0.9,
                is_final: true,
            },
            CallId::from(call),
        )
        .with_correlation(uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(Topic::SttResult);

        bus.publish(stt_result("c1", "hello")).await.unwrap();
        let envelope = sub.recv().await;
        assert_eq!(envelope.topic, Topic::SttResult);
        assert_eq!(envelope.call_id, Some(CallId::from("c1")));
        assert_eq!(envelope.schema_version, SCHEMA_VERSION);
        assert!(matches!(envelope.payload, Payload::SttResult { .. }));
    }

    #[tokio::test]
    async fn test_topic_isolation() {
        let bus = Bus::new();
        let mut stt = bus.subscribe(Topic::SttResult);
        let mut llm = bus.subscribe(Topic::LlmRequest);

        bus.publish(stt_result("c1", "hi")).await.unwrap();
        // The message landed on the stt subscription only
        let envelope = stt.recv().await;
        assert_eq!(envelope.topic, Topic::SttResult);
        assert!(llm.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_order_preserved_per_call() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(Topic::SttResult);

        for i in 0..20 {
            bus.publish(stt_result("c1", &format!("msg-{i}"))).await.unwrap();
        }
        for i in 0..20 {
            let envelope = sub.recv().await;
            match envelope.payload {
                Payload::SttResult { text, .. } => assert_eq!(text, format!("msg-{i}")),
                other => panic!("unexpected payload {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_fanout_to_all_subscribers() {
        let bus = Bus::new();
        let mut a = bus.subscribe(Topic::BargeIn);
        let mut b = bus.subscribe(Topic::BargeIn);

        bus.publish(Envelope::for_call(
            Payload::BargeIn { confidence: 0.95 },
            CallId::from("c1"),
        ))
        .await
        .unwrap();

        assert_eq!(a.recv().await.topic, Topic::BargeIn);
        assert_eq!(b.recv().await.topic, Topic::BargeIn);
    }

    #[tokio::test]
    async fn test_drop_oldest_on_control_topic() {
        let bus = Bus::with_capacity(2);
        let mut sub = bus.subscribe(Topic::BargeIn);

        for i in 0..4 {
            bus.publish(
                Envelope::for_call(
                    Payload::BargeIn {
                        confidence: i as f32 / 10.0,
                    },
                    CallId::from("c1"),
                ),
            )
            .await
            .unwrap();
        }

        // Only the newest two survive
        let first = sub.recv().await;
        match first.payload {
            Payload::BargeIn { confidence } => assert!((confidence - 0.2).abs() < 1e-6),
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(sub.depth(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_topic_surfaces_full() {
        let bus = Bus::with_capacity(1);
        let _sub = bus.subscribe(Topic::SttRequest);

        let request = |i: u32| {
            Envelope::for_call(
                Payload::SttRequest {
                    audio: vec![0u8; 16],
                    sample_rate: 8000,
                    language: format!("en-{i}"),
                },
                CallId::from("c1"),
            )
        };

        bus.publish(request(0)).await.unwrap();
        // Nobody is draining: the second publish exhausts its retries
        let err = bus.publish(request(1)).await.unwrap_err();
        assert!(matches!(err, BusError::SubscriberFull(Topic::SttRequest)));
    }

    #[tokio::test]
    async fn test_blocked_publisher_resumes_when_drained() {
        let bus = Arc::new(Bus::with_capacity(1));
        let mut sub = bus.subscribe(Topic::SttRequest);

        let request = || {
            Envelope::for_call(
                Payload::SttRequest {
                    audio: vec![0u8; 16],
                    sample_rate: 8000,
                    language: "en".into(),
                },
                CallId::from("c1"),
            )
        };

        bus.publish(request()).await.unwrap();

        let bus2 = bus.clone();
        let publisher = tokio::spawn(async move { bus2.publish(request()).await });

        // Drain one message; the blocked publisher should complete
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = sub.recv().await;
        publisher.await.unwrap().unwrap();
        assert_eq!(sub.depth(), 1);
    }

    #[tokio::test]
    async fn test_dropped_subscription_pruned() {
        let bus = Bus::new();
        {
            let _sub = bus.subscribe(Topic::Health);
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_schema_check() {
        let mut envelope = stt_result("c1", "x");
        assert!(envelope.check_schema().is_ok());
        envelope.schema_version = SCHEMA_VERSION + 1;
        assert!(matches!(
            envelope.check_schema(),
            Err(BusError::IncompatibleSchema { .. })
        ));
    }

    #[test]
    fn test_payload_topic_mapping() {
        assert_eq!(Payload::LlmCancel.topic(), Topic::LlmCancel);
        assert_eq!(
            Payload::CallControl(ControlAction::StopAudio).topic(),
            Topic::CallControl
        );
        assert_eq!(Topic::SttRequest.as_str(), "stt.request");
    }

    #[test]
    fn test_overflow_policies() {
        assert_eq!(Topic::SttRequest.overflow_policy(), OverflowPolicy::Block);
        assert_eq!(Topic::BargeIn.overflow_policy(), OverflowPolicy::DropOldest);
        assert_eq!(Topic::Health.overflow_policy(), OverflowPolicy::DropOldest);
    }
}
