//! Per-call RTP media session
//!
//! One UDP socket per call, serviced by a dedicated ingress task that
//! parses packets, tracks per-SSRC streams, decodes payloads and drives the
//! call's audio pipeline. A sibling egress task encodes synthesized speech,
//! paces it onto the wire in 20 ms packets and mirrors it into the
//! pipeline's echo reference.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::correlation::CorrelationMap;
use super::packet::RtpPacket;
use super::stream::{Ingress, RtpStream};
use super::RtpError;
use crate::audio::{self, Codec};
use crate::pipeline::{CallPipeline, PipelineEvent};
use crate::stats::EngineStats;
use crate::types::CallId;

/// Concurrent SSRCs tolerated on one session before new streams are
/// refused (re-invites can legitimately change SSRC once)
const MAX_STREAMS_PER_SESSION: usize = 4;

/// Events surfaced by the media session to the call's event loop
#[derive(Debug)]
pub enum SessionEvent {
    /// First packet delivered: media is flowing
    MediaBound,
    Pipeline(PipelineEvent),
    /// The conditioning pipeline failed; the call must go to ERROR
    PipelineFailed(String),
    /// The egress queue drained after a play command
    EgressFinished,
}

/// Commands accepted by the egress half
#[derive(Debug)]
pub enum EgressCommand {
    /// Queue linear PCM (at the negotiated codec's rate) for transmission
    Play(Vec<i16>),
    /// Drop everything still queued
    Stop,
}

/// Per-session counters; `lost_packets` feeds the call snapshot, and
/// every increment is mirrored into the engine-wide aggregate
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub packets_received: u64,
    pub malformed_packets: u64,
    pub packets_sent: u64,
    pub lost_packets: u64,
    pub streams_refused: u64,
}

/// Handle kept by the call for its media session
#[derive(Clone)]
pub struct RtpSessionHandle {
    pub local_port: u16,
    pub egress: mpsc::Sender<EgressCommand>,
    stats: Arc<Mutex<SessionStats>>,
}

impl RtpSessionHandle {
    pub fn stats(&self) -> SessionStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Everything the session tasks need at spawn time
pub struct RtpSessionConfig {
    pub call_id: CallId,
    pub codec: Codec,
    pub local_port: u16,
    pub bind_host: String,
    /// Flush an open utterance after this long without ingress packets
    pub silence_flush: Duration,
}

/// Derive the egress SSRC for a call (stable for the call's lifetime)
pub fn derive_ssrc(call_id: &CallId) -> u32 {
    // FNV-1a over the call id
    let mut hash: u32 = 0x811c_9dc5;
    for byte in call_id.as_str().bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Bind the socket and spawn the ingress/egress tasks.
pub async fn spawn(
    config: RtpSessionConfig,
    pipeline: CallPipeline,
    correlation: Arc<CorrelationMap>,
    engine_stats: Arc<EngineStats>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: watch::Receiver<bool>,
) -> Result<RtpSessionHandle, RtpError> {
    let socket = UdpSocket::bind((config.bind_host.as_str(), config.local_port))
        .await
        .map_err(|e| RtpError::Bind {
            port: config.local_port,
            source: e,
        })?;
    let socket = Arc::new(socket);
    let stats = Arc::new(Mutex::new(SessionStats::default()));

    let (egress_tx, egress_rx) = mpsc::channel(16);
    let (reference_tx, reference_rx) = mpsc::unbounded_channel();

    info!(
        call_id = %config.call_id,
        port = config.local_port,
        codec = %config.codec,
        "RTP session started"
    );

    tokio::spawn(run_ingress(
        IngressContext {
            call_id: config.call_id.clone(),
            codec: config.codec,
            socket: socket.clone(),
            pipeline,
            correlation: correlation.clone(),
            events: events.clone(),
            stats: stats.clone(),
            engine_stats: engine_stats.clone(),
            silence_flush: config.silence_flush,
        },
        reference_rx,
        cancel.clone(),
    ));

    tokio::spawn(run_egress(
        EgressContext {
            call_id: config.call_id.clone(),
            codec: config.codec,
            socket,
            correlation,
            events,
            stats: stats.clone(),
            engine_stats,
            reference: reference_tx,
        },
        egress_rx,
        cancel,
    ));

    Ok(RtpSessionHandle {
        local_port: config.local_port,
        egress: egress_tx,
        stats,
    })
}

struct IngressContext {
    call_id: CallId,
    /// Negotiated session codec; off-negotiation payloads are transcoded
    codec: Codec,
    socket: Arc<UdpSocket>,
    pipeline: CallPipeline,
    correlation: Arc<CorrelationMap>,
    events: mpsc::UnboundedSender<SessionEvent>,
    stats: Arc<Mutex<SessionStats>>,
    engine_stats: Arc<EngineStats>,
    silence_flush: Duration,
}

async fn run_ingress(
    mut ctx: IngressContext,
    mut reference_rx: mpsc::UnboundedReceiver<Vec<i16>>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 2048];
    let mut streams: HashMap<u32, RtpStream> = HashMap::new();
    let mut last_packet = Instant::now();
    let mut pipeline_dead = false;
    let mut media_bound = false;

    loop {
        let flush_at = last_packet + ctx.silence_flush;
        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    break;
                }
            }
            Some(samples) = reference_rx.recv() => {
                ctx.pipeline.push_reference(&samples);
            }
            _ = tokio::time::sleep_until(flush_at) => {
                last_packet = Instant::now();
                if !pipeline_dead {
                    for event in ctx.pipeline.flush() {
                        let _ = ctx.events.send(SessionEvent::Pipeline(event));
                    }
                }
            }
            received = ctx.socket.recv_from(&mut buf) => {
                let (len, addr) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(call_id = %ctx.call_id, error = %e, "RTP socket read failed");
                        break;
                    }
                };
                last_packet = Instant::now();
                if pipeline_dead {
                    continue;
                }

                let packet = match RtpPacket::parse(&buf[..len]) {
                    Ok(p) => p,
                    Err(e) => {
                        // Protocol violation: count, drop, keep the call alive
                        ctx.stats.lock().unwrap().malformed_packets += 1;
                        ctx.engine_stats.record_packet_dropped();
                        debug!(call_id = %ctx.call_id, error = %e, "dropping malformed packet");
                        continue;
                    }
                };
                ctx.stats.lock().unwrap().packets_received += 1;
                ctx.engine_stats.record_packet_received();

                let ingress = match streams.get_mut(&packet.ssrc) {
                    Some(stream) => stream.ingress(&packet),
                    None => {
                        if streams.len() >= MAX_STREAMS_PER_SESSION {
                            ctx.stats.lock().unwrap().streams_refused += 1;
                            ctx.engine_stats.record_packet_dropped();
                            warn!(
                                call_id = %ctx.call_id,
                                ssrc = packet.ssrc,
                                "stream limit exceeded, refusing new SSRC"
                            );
                            continue;
                        }
                        // First packet of a new SSRC: bind it to this call
                        // and learn the remote endpoint for symmetric RTP.
                        ctx.correlation.bind_ssrc(packet.ssrc, &ctx.call_id);
                        ctx.correlation.set_remote(&ctx.call_id, addr);
                        streams.insert(packet.ssrc, RtpStream::new(&packet));
                        Ingress::Deliver { new_talk_spurt: false }
                    }
                };

                match ingress {
                    Ingress::Duplicate => continue,
                    Ingress::Deliver { new_talk_spurt } => {
                        if !media_bound {
                            media_bound = true;
                            let _ = ctx.events.send(SessionEvent::MediaBound);
                        }
                        if new_talk_spurt {
                            ctx.pipeline.clear_partial();
                        }

                        let packet_codec = match Codec::from_payload_type(packet.payload_type) {
                            Ok(c) => c,
                            Err(_) => {
                                ctx.stats.lock().unwrap().malformed_packets += 1;
                                ctx.engine_stats.record_packet_dropped();
                                continue;
                            }
                        };

                        // A payload off the negotiated codec is normalized
                        // to the session codec before decoding
                        let payload = if packet_codec != ctx.codec {
                            match audio::transcode(&packet.payload, packet_codec, ctx.codec) {
                                Ok(normalized) => {
                                    ctx.engine_stats.record_transcode();
                                    debug!(
                                        call_id = %ctx.call_id,
                                        from = %packet_codec,
                                        to = %ctx.codec,
                                        "transcoded off-negotiation payload"
                                    );
                                    normalized
                                }
                                Err(e) => {
                                    ctx.stats.lock().unwrap().malformed_packets += 1;
                                    ctx.engine_stats.record_packet_dropped();
                                    debug!(
                                        call_id = %ctx.call_id,
                                        error = %e,
                                        "untranscodable payload"
                                    );
                                    continue;
                                }
                            }
                        } else {
                            packet.payload.clone()
                        };

                        let samples = match audio::decode(&payload, ctx.codec) {
                            Ok(s) => s,
                            Err(e) => {
                                ctx.stats.lock().unwrap().malformed_packets += 1;
                                ctx.engine_stats.record_packet_dropped();
                                debug!(call_id = %ctx.call_id, error = %e, "undecodable payload");
                                continue;
                            }
                        };

                        match ctx.pipeline.process(&samples) {
                            Ok(events) => {
                                for event in events {
                                    let _ = ctx.events.send(SessionEvent::Pipeline(event));
                                }
                            }
                            Err(e) => {
                                pipeline_dead = true;
                                let _ = ctx
                                    .events
                                    .send(SessionEvent::PipelineFailed(e.to_string()));
                            }
                        }

                        if let Some(stream) = streams.get(&packet.ssrc) {
                            ctx.stats.lock().unwrap().lost_packets =
                                stream.stats().lost_packets;
                        }
                    }
                }
            }
        }
    }
    debug!(call_id = %ctx.call_id, "RTP ingress task stopped");
}

struct EgressContext {
    call_id: CallId,
    codec: Codec,
    socket: Arc<UdpSocket>,
    correlation: Arc<CorrelationMap>,
    events: mpsc::UnboundedSender<SessionEvent>,
    stats: Arc<Mutex<SessionStats>>,
    engine_stats: Arc<EngineStats>,
    reference: mpsc::UnboundedSender<Vec<i16>>,
}

async fn run_egress(
    ctx: EgressContext,
    mut commands: mpsc::Receiver<EgressCommand>,
    mut cancel: watch::Receiver<bool>,
) {
    let samples_per_frame = ctx.codec.samples_per_frame();
    let ssrc = derive_ssrc(&ctx.call_id);
    let mut sequence: u16 = 0;
    let mut timestamp: u32 = 0;
    let mut queue: std::collections::VecDeque<Vec<i16>> = std::collections::VecDeque::new();
    let mut spurt_start = true;

    let mut pacer = interval(Duration::from_millis(20));
    pacer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    break;
                }
            }
            command = commands.recv() => {
                match command {
                    Some(EgressCommand::Play(pcm)) => {
                        for chunk in pcm.chunks(samples_per_frame) {
                            let mut frame = chunk.to_vec();
                            frame.resize(samples_per_frame, 0);
                            queue.push_back(frame);
                        }
                        debug!(
                            call_id = %ctx.call_id,
                            frames = queue.len(),
                            "egress audio queued"
                        );
                    }
                    Some(EgressCommand::Stop) => {
                        queue.clear();
                        spurt_start = true;
                    }
                    None => break,
                }
            }
            _ = pacer.tick(), if !queue.is_empty() => {
                let frame = queue.pop_front().unwrap();
                let payload = audio::encode(&frame, ctx.codec);

                let packet = RtpPacket::outbound(
                    ctx.codec.payload_type().unwrap_or(0),
                    sequence,
                    timestamp,
                    ssrc,
                    spurt_start,
                    payload,
                );
                spurt_start = false;
                sequence = sequence.wrapping_add(1);
                timestamp = timestamp.wrapping_add(samples_per_frame as u32);

                let remote = ctx
                    .correlation
                    .record(&ctx.call_id)
                    .and_then(|r| r.remote);
                if let Some(remote) = remote {
                    if let Err(e) = ctx.socket.send_to(&packet.serialize(), remote).await {
                        warn!(call_id = %ctx.call_id, error = %e, "egress send failed");
                    } else {
                        ctx.stats.lock().unwrap().packets_sent += 1;
                        ctx.engine_stats.record_packet_sent();
                    }
                }

                // Mirror into the echo-cancellation reference
                let _ = ctx.reference.send(frame);

                if queue.is_empty() {
                    spurt_start = true;
                    let _ = ctx.events.send(SessionEvent::EgressFinished);
                }
            }
        }
    }
    debug!(call_id = %ctx.call_id, "RTP egress task stopped");
}
