//! End-to-end call flow scenarios
//!
//! Drives the in-process engine with synthetic RTP and canned model
//! backends: a mock switch records the control calls, real UDP sockets
//! carry the media, and the bus carries everything else.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

use voicebridge::audio::{encode, Codec};
use voicebridge::bus::{Bus, Envelope, Payload, Topic};
use voicebridge::call::{CallRegistry, CallState};
use voicebridge::orchestrator::{FallbackCategory, FallbackResponses, Orchestrator, OrchestratorConfig};
use voicebridge::rtp::{CorrelationMap, PortPool, RtpPacket};
use voicebridge::stats::EngineStats;
use voicebridge::store::{ArtifactStore, ConversationStore};
use voicebridge::switch::SwitchControl;
use voicebridge::types::{CallDirection, CallId, ChannelId, ChatMessage};
use voicebridge::workers::{
    self, Completion, LlmBackend, LlmWorkerConfig, SttWorkerConfig, TtsWorkerConfig,
};

/// Each test takes a disjoint RTP port range so they can run in parallel
static NEXT_PORT_BASE: AtomicU16 = AtomicU16::new(41000);

/// Switch double that records every control call
#[derive(Default)]
struct MockSwitch {
    ops: Mutex<Vec<String>>,
}

impl MockSwitch {
    fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn record(&self, op: impl Into<String>) {
        self.ops.lock().unwrap().push(op.into());
    }

    fn count(&self, prefix: &str) -> usize {
        self.ops()
            .iter()
            .filter(|op| op.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl SwitchControl for MockSwitch {
    async fn answer(&self, channel: &ChannelId) -> Result<()> {
        self.record(format!("answer:{channel}"));
        Ok(())
    }
    async fn start_external_media(
        &self,
        channel: &ChannelId,
        _host: &str,
        _port: u16,
        _format: &str,
    ) -> Result<()> {
        self.record(format!("external_media:{channel}"));
        Ok(())
    }
    async fn play(&self, channel: &ChannelId, _handle: &str) -> Result<()> {
        self.record(format!("play:{channel}"));
        Ok(())
    }
    async fn stop_playback(&self, channel: &ChannelId) -> Result<()> {
        self.record(format!("stop:{channel}"));
        Ok(())
    }
    async fn hangup(&self, channel: &ChannelId) -> Result<()> {
        self.record(format!("hangup:{channel}"));
        Ok(())
    }
    async fn say(&self, channel: &ChannelId, text: &str) -> Result<()> {
        self.record(format!("say:{channel}:{text}"));
        Ok(())
    }
    async fn list_channels(&self) -> Result<Vec<ChannelId>> {
        Ok(Vec::new())
    }
    async fn originate(&self, _endpoint: &str) -> Result<ChannelId> {
        Ok(ChannelId::from("originated"))
    }
    async fn snoop(&self, channel: &ChannelId) -> Result<ChannelId> {
        Ok(ChannelId::from(format!("snoop-{channel}").as_str()))
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    bus: Arc<Bus>,
    switch: Arc<MockSwitch>,
    registry: Arc<CallRegistry>,
    ports: Arc<PortPool>,
    stats: Arc<EngineStats>,
    _shutdown: watch::Sender<bool>,
    _artifact_dir: tempfile::TempDir,
}

async fn build_harness(
    llm: Arc<dyn LlmBackend>,
    tune: impl FnOnce(&mut OrchestratorConfig),
) -> Harness {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bus = Arc::new(Bus::new());
    let registry = Arc::new(CallRegistry::new());
    let base = NEXT_PORT_BASE.fetch_add(50, Ordering::SeqCst);
    let ports = Arc::new(PortPool::new(base, base + 49));
    let correlation = Arc::new(CorrelationMap::new());

    let artifact_dir = tempfile::tempdir().unwrap();
    let artifacts = Arc::new(
        ArtifactStore::new(artifact_dir.path(), Duration::from_secs(300)).unwrap(),
    );
    let conversations =
        Arc::new(ConversationStore::in_memory(Duration::from_secs(3600)).unwrap());

    workers::spawn_stt_worker(
        bus.clone(),
        Arc::new(workers::backend::StaticSttBackend {
            text: "turn off the kitchen lights".into(),
            confidence: 0.93,
        }),
        SttWorkerConfig::default(),
        shutdown_rx.clone(),
    );
    workers::spawn_llm_worker(
        bus.clone(),
        llm,
        LlmWorkerConfig::default(),
        shutdown_rx.clone(),
    );
    workers::spawn_tts_worker(
        bus.clone(),
        Arc::new(workers::backend::StaticTtsBackend),
        artifacts.clone(),
        TtsWorkerConfig::default(),
        shutdown_rx.clone(),
    );

    let mut config = OrchestratorConfig {
        bind_host: "127.0.0.1".into(),
        advertise_host: "127.0.0.1".into(),
        ..Default::default()
    };
    // Quiet DSP for deterministic synthetic levels
    config.pipeline.noise_mode = voicebridge::pipeline::noise::NoiseMode::Off;
    tune(&mut config);

    let switch = Arc::new(MockSwitch::default());
    let stats = Arc::new(EngineStats::default());
    let orchestrator = Arc::new(Orchestrator {
        config: Arc::new(config),
        bus: bus.clone(),
        registry: registry.clone(),
        ports: ports.clone(),
        correlation,
        artifacts,
        conversations,
        switch: switch.clone(),
        fallback: Arc::new(FallbackResponses::new()),
        stats: stats.clone(),
    });
    orchestrator.spawn_dispatchers(shutdown_rx);

    Harness {
        orchestrator,
        bus,
        switch,
        registry,
        ports,
        stats,
        _shutdown: shutdown_tx,
        _artifact_dir: artifact_dir,
    }
}

fn speech_payload() -> Vec<u8> {
    let samples: Vec<i16> = (0..160)
        .map(|i| ((i as f32 * 0.7).sin() * 12000.0) as i16)
        .collect();
    encode(&samples, Codec::Pcmu)
}

fn silence_payload() -> Vec<u8> {
    encode(&[0i16; 160], Codec::Pcmu)
}

fn noise_payload() -> Vec<u8> {
    // Low-level line noise, well below the VAD's absolute gate
    let samples: Vec<i16> = (0..160)
        .map(|i| if i % 2 == 0 { 90 } else { -90 })
        .collect();
    encode(&samples, Codec::Pcmu)
}

/// Wait until the call's snapshot satisfies the predicate
async fn wait_for_state(
    registry: &CallRegistry,
    call_id: &CallId,
    want: CallState,
    within: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        match registry.get(call_id) {
            Some(handle) => {
                if handle.snapshot().state == want {
                    return true;
                }
            }
            None => return false,
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

struct CallUnderTest {
    call_id: CallId,
    port: u16,
    sender: tokio::net::UdpSocket,
}

impl CallUnderTest {
    async fn start(harness: &Harness, channel: &str) -> Self {
        let call_id = harness
            .orchestrator
            .start_call(
                ChannelId::from(channel),
                Some("+15550100".into()),
                CallDirection::Inbound,
                None,
            )
            .await
            .unwrap();
        let port = harness
            .registry
            .get(&call_id)
            .unwrap()
            .snapshot()
            .local_port
            .unwrap();
        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Self {
            call_id,
            port,
            sender,
        }
    }

    async fn send_packet(&self, seq: u16, payload: Vec<u8>) {
        let packet = RtpPacket::outbound(
            0,
            seq,
            160 * (seq as u32),
            0xDEADBEEF,
            false,
            payload,
        );
        self.sender
            .send_to(&packet.serialize(), ("127.0.0.1", self.port))
            .await
            .unwrap();
    }
}

/// S1: 300 ms of speech then silence becomes exactly one turn through the
/// whole pipeline, tracing CONNECTED → LISTENING → PROCESSING → SPEAKING
/// → LISTENING with one request per service.
#[tokio::test]
async fn scenario_happy_path() {
    let harness = build_harness(
        Arc::new(workers::backend::StaticLlmBackend),
        |_config| {},
    )
    .await;

    let mut stt_requests = harness.bus.subscribe(Topic::SttRequest);
    let mut llm_requests = harness.bus.subscribe(Topic::LlmRequest);
    let mut tts_requests = harness.bus.subscribe(Topic::TtsRequest);

    let call = CallUnderTest::start(&harness, "chan-s1").await;

    assert!(
        wait_for_state(
            &harness.registry,
            &call.call_id,
            CallState::Connected,
            Duration::from_secs(2)
        )
        .await
    );

    // 100 packets, seq 1000..1099: 15 speech frames then 85 of silence
    for i in 0..100u16 {
        let payload = if i < 15 {
            speech_payload()
        } else {
            silence_payload()
        };
        call.send_packet(1000 + i, payload).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    // Media flow lifts the call out of CONNECTED, the turn ends SPEAKING,
    // playback completion brings it back to LISTENING
    assert!(
        wait_for_state(
            &harness.registry,
            &call.call_id,
            CallState::Speaking,
            Duration::from_secs(5)
        )
        .await,
        "call never reached SPEAKING"
    );
    assert!(
        wait_for_state(
            &harness.registry,
            &call.call_id,
            CallState::Listening,
            Duration::from_secs(10)
        )
        .await,
        "call never returned to LISTENING"
    );

    // Exactly one request per model service
    let stt = stt_requests.recv().await;
    match &stt.payload {
        Payload::SttRequest { sample_rate, audio, .. } => {
            assert_eq!(*sample_rate, 8000);
            // ~300 ms of 8 kHz PCM
            let duration_ms = audio.len() as u64 / 2 * 1000 / 8000;
            assert!((280..=320).contains(&duration_ms), "got {duration_ms} ms");
        }
        other => panic!("unexpected payload {other:?}"),
    }
    assert!(stt_requests.try_recv().is_none(), "second stt.request seen");

    let llm = llm_requests.recv().await;
    match &llm.payload {
        Payload::LlmRequest { messages, .. } => {
            assert_eq!(messages.len(), 2); // system + user
            assert_eq!(messages[1].content, "turn off the kitchen lights");
        }
        other => panic!("unexpected payload {other:?}"),
    }
    assert!(llm_requests.try_recv().is_none(), "second llm.request seen");

    let tts = tts_requests.recv().await;
    assert!(matches!(tts.payload, Payload::TtsRequest { .. }));
    assert!(tts_requests.try_recv().is_none(), "second tts.request seen");

    // The switch was told to play the artifact
    assert!(harness.switch.count("play:") >= 1);

    // The engine aggregate saw the whole flow
    let snapshot = harness.stats.snapshot();
    assert!(snapshot.packets_received >= 90);
    assert_eq!(snapshot.utterances_emitted, 1);
    assert_eq!(snapshot.conversations_created, 1);
    assert!(snapshot.packets_sent >= 1, "egress audio was streamed");
}

/// S2: five packets lost in the middle of the spurt; the loss is counted,
/// the utterance still comes out, and the FSM never errors.
#[tokio::test]
async fn scenario_packet_loss() {
    let harness = build_harness(
        Arc::new(workers::backend::StaticLlmBackend),
        |_config| {},
    )
    .await;
    let mut stt_requests = harness.bus.subscribe(Topic::SttRequest);

    let call = CallUnderTest::start(&harness, "chan-s2").await;

    for i in 0..100u16 {
        // Drop seq 1040..=1044
        if (40..45).contains(&i) {
            continue;
        }
        let payload = if i < 15 {
            speech_payload()
        } else {
            silence_payload()
        };
        call.send_packet(1000 + i, payload).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let stt = stt_requests.recv().await;
    assert!(matches!(stt.payload, Payload::SttRequest { .. }));

    // Loss accounted, no FSM error
    let handle = harness.registry.get(&call.call_id).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if handle.snapshot().lost_packets == 5 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "lost_packets = {} after deadline",
            handle.snapshot().lost_packets
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_ne!(handle.snapshot().state, CallState::Error);
}

/// S3: speech during SPEAKING triggers a debounced barge-in that cancels
/// the turn, stops playback and returns to LISTENING.
#[tokio::test]
async fn scenario_barge_in() {
    let harness = build_harness(
        Arc::new(workers::backend::StaticLlmBackend),
        |_config| {},
    )
    .await;
    let mut barge_events = harness.bus.subscribe(Topic::BargeIn);
    let mut llm_cancels = harness.bus.subscribe(Topic::LlmCancel);
    let mut tts_cancels = harness.bus.subscribe(Topic::TtsCancel);

    let call = CallUnderTest::start(&harness, "chan-s3").await;

    // Drive one turn into SPEAKING. The static TTS tone is long enough
    // (several hundred ms) to interrupt.
    for i in 0..40u16 {
        let payload = if i < 15 {
            speech_payload()
        } else {
            silence_payload()
        };
        call.send_packet(1000 + i, payload).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(
        wait_for_state(
            &harness.registry,
            &call.call_id,
            CallState::Speaking,
            Duration::from_secs(5)
        )
        .await,
        "call never reached SPEAKING"
    );

    // Inject 250 ms of confident speech while the agent is talking
    for i in 0..13u16 {
        call.send_packet(1040 + i, speech_payload()).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let barge = tokio::time::timeout(Duration::from_millis(500), barge_events.recv())
        .await
        .expect("barge-in not published in time");
    assert!(matches!(barge.payload, Payload::BargeIn { .. }));
    let correlation = barge.correlation_id.expect("barge-in carries the turn id");

    let cancel = tokio::time::timeout(Duration::from_millis(500), llm_cancels.recv())
        .await
        .expect("llm.cancel missing");
    assert_eq!(cancel.correlation_id, Some(correlation));
    let cancel = tokio::time::timeout(Duration::from_millis(500), tts_cancels.recv())
        .await
        .expect("tts.cancel missing");
    assert_eq!(cancel.correlation_id, Some(correlation));

    assert!(
        wait_for_state(
            &harness.registry,
            &call.call_id,
            CallState::Listening,
            Duration::from_millis(500)
        )
        .await,
        "barge-in did not return the call to LISTENING"
    );
    assert!(harness.switch.count("stop:") >= 1, "stop_audio never sent");
}

/// S4: nothing but sub-gate background noise runs the silence timer out;
/// the call times out and its port is back in the pool within a second.
#[tokio::test]
async fn scenario_silence_timeout() {
    let harness = build_harness(
        Arc::new(workers::backend::StaticLlmBackend),
        |config| {
            config.default_instructions.silence_timeout_s = 2;
        },
    )
    .await;

    let available_before = harness.ports.available_count();
    let call = CallUnderTest::start(&harness, "chan-s4").await;
    assert_eq!(harness.ports.available_count(), available_before - 1);

    // ~2.6 s of background noise that the VAD keeps classifying as
    // non-speech
    for i in 0..130u16 {
        call.send_packet(1000 + i, noise_payload()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The call is torn down: registry entry gone, port back within 1 s
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while harness.registry.get(&call.call_id).is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "call never timed out"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let release_deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while harness.ports.available_count() != available_before {
        assert!(
            tokio::time::Instant::now() < release_deadline,
            "port not released within 1s of termination"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Terminal teardown also hangs the channel up
    assert!(harness.switch.count("hangup:") >= 1);
}

/// A backend that always fails, for the fallback path
struct DeadLlmBackend;

#[async_trait]
impl LlmBackend for DeadLlmBackend {
    async fn complete(
        &self,
        _: &str,
        _: &[ChatMessage],
        _: u32,
        _: f32,
        _: Option<tokio::sync::mpsc::UnboundedSender<String>>,
    ) -> Result<Completion> {
        anyhow::bail!("503 model down")
    }
}

/// S5: the LLM fails for the turn; the agent speaks a scripted apology
/// from the ERROR_GENERIC set and the call continues without an ERROR
/// state.
#[tokio::test]
async fn scenario_llm_failure_fallback() {
    let harness = build_harness(Arc::new(DeadLlmBackend), |_config| {}).await;
    let mut llm_errors = harness.bus.subscribe(Topic::LlmError);
    let mut tts_requests = harness.bus.subscribe(Topic::TtsRequest);

    let call = CallUnderTest::start(&harness, "chan-s5").await;

    for i in 0..40u16 {
        let payload = if i < 15 {
            speech_payload()
        } else {
            silence_payload()
        };
        call.send_packet(1000 + i, payload).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let error = llm_errors.recv().await;
    assert!(matches!(error.payload, Payload::LlmError { .. }));

    // The follow-up TTS request speaks an ERROR_GENERIC template
    let tts = tts_requests.recv().await;
    let text = match tts.payload {
        Payload::TtsRequest { text, .. } => text,
        other => panic!("unexpected payload {other:?}"),
    };
    let templates = FallbackResponses::new();
    assert!(
        templates
            .all(FallbackCategory::ErrorGeneric)
            .contains(&text),
        "fallback text {text:?} not from ERROR_GENERIC set"
    );

    // The call speaks the apology and returns to LISTENING, never ERROR
    assert!(
        wait_for_state(
            &harness.registry,
            &call.call_id,
            CallState::Speaking,
            Duration::from_secs(5)
        )
        .await
    );
    assert!(
        wait_for_state(
            &harness.registry,
            &call.call_id,
            CallState::Listening,
            Duration::from_secs(10)
        )
        .await
    );
    assert_ne!(
        harness.registry.get(&call.call_id).unwrap().snapshot().state,
        CallState::Error
    );
}

/// `call.control.generate_response` makes the agent speak unprompted, and
/// `call.control.end_conversation` tears the call down.
#[tokio::test]
async fn scenario_control_plane() {
    let harness = build_harness(
        Arc::new(workers::backend::StaticLlmBackend),
        |_config| {},
    )
    .await;
    let mut tts_requests = harness.bus.subscribe(Topic::TtsRequest);

    let call = CallUnderTest::start(&harness, "chan-ctl").await;

    // A little silence gets media bound and the call LISTENING
    for i in 0..5u16 {
        call.send_packet(1000 + i, silence_payload()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(
        wait_for_state(
            &harness.registry,
            &call.call_id,
            CallState::Listening,
            Duration::from_secs(2)
        )
        .await
    );

    harness
        .bus
        .publish(Envelope::for_call(
            Payload::CallControl(voicebridge::bus::ControlAction::GenerateResponse {
                text: "your order has shipped".into(),
            }),
            call.call_id.clone(),
        ))
        .await
        .unwrap();

    let tts = tts_requests.recv().await;
    match tts.payload {
        Payload::TtsRequest { text, .. } => assert_eq!(text, "your order has shipped"),
        other => panic!("unexpected payload {other:?}"),
    }

    harness
        .bus
        .publish(Envelope::for_call(
            Payload::CallControl(voicebridge::bus::ControlAction::EndConversation),
            call.call_id.clone(),
        ))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while harness.registry.get(&call.call_id).is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "end_conversation did not terminate the call"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Late duplicate results for a consumed correlation ID are discarded:
/// replaying the stt.result does not provoke a second llm.request.
#[tokio::test]
async fn scenario_duplicate_result_discarded() {
    let harness = build_harness(
        Arc::new(workers::backend::StaticLlmBackend),
        |_config| {},
    )
    .await;
    let mut stt_results = harness.bus.subscribe(Topic::SttResult);
    let mut llm_requests = harness.bus.subscribe(Topic::LlmRequest);

    let call = CallUnderTest::start(&harness, "chan-dup").await;

    for i in 0..40u16 {
        let payload = if i < 15 {
            speech_payload()
        } else {
            silence_payload()
        };
        call.send_packet(1000 + i, payload).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    // Capture the genuine result, then replay it verbatim
    let result = stt_results.recv().await;
    let _first_llm = llm_requests.recv().await;

    let mut replay = Envelope::for_call(result.payload.clone(), call.call_id.clone());
    replay.correlation_id = result.correlation_id;
    harness.bus.publish(replay).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        llm_requests.try_recv().is_none(),
        "duplicate stt.result provoked a second llm.request"
    );
}
