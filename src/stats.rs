//! Engine-wide counters
//!
//! One process-global accumulator fed by every subsystem: the RTP
//! sessions, the per-call pipelines, the codec normalization path and the
//! conversation lifecycle. The status endpoint serves a snapshot of it,
//! the way the original kept a `stats` dict per manager. Handed to
//! components explicitly, never reached through a singleton.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Aggregate counters across all calls
#[derive(Debug, Default)]
pub struct EngineStats {
    // RTP plane
    packets_received: AtomicU64,
    /// Malformed, undecodable or refused packets (counted, dropped)
    packets_dropped: AtomicU64,
    packets_sent: AtomicU64,
    // Audio pipeline
    frames_processed: AtomicU64,
    utterances_emitted: AtomicU64,
    stage_failures: AtomicU64,
    // Codec layer
    transcodes_performed: AtomicU64,
    // Conversations
    conversations_created: AtomicU64,
    conversations_ended: AtomicU64,
}

/// Point-in-time view served by the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatsSnapshot {
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub packets_sent: u64,
    pub frames_processed: u64,
    pub utterances_emitted: u64,
    pub stage_failures: u64,
    pub transcodes_performed: u64,
    pub conversations_created: u64,
    pub conversations_ended: u64,
}

impl EngineStats {
    pub fn record_packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_packet_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_packet_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_processed(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_utterance_emitted(&self) {
        self.utterances_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage_failure(&self) {
        self.stage_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transcode(&self) {
        self.transcodes_performed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conversation_created(&self) {
        self.conversations_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conversation_ended(&self) {
        self.conversations_ended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            utterances_emitted: self.utterances_emitted.load(Ordering::Relaxed),
            stage_failures: self.stage_failures.load(Ordering::Relaxed),
            transcodes_performed: self.transcodes_performed.load(Ordering::Relaxed),
            conversations_created: self.conversations_created.load(Ordering::Relaxed),
            conversations_ended: self.conversations_ended.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = EngineStats::default();
        stats.record_packet_received();
        stats.record_packet_received();
        stats.record_packet_dropped();
        stats.record_frame_processed();
        stats.record_utterance_emitted();
        stats.record_transcode();
        stats.record_conversation_created();
        stats.record_conversation_ended();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.packets_received, 2);
        assert_eq!(snapshot.packets_dropped, 1);
        assert_eq!(snapshot.frames_processed, 1);
        assert_eq!(snapshot.utterances_emitted, 1);
        assert_eq!(snapshot.transcodes_performed, 1);
        assert_eq!(snapshot.conversations_created, 1);
        assert_eq!(snapshot.conversations_ended, 1);
        assert_eq!(snapshot.packets_sent, 0);
        assert_eq!(snapshot.stage_failures, 0);
    }

    #[test]
    fn test_snapshot_serializes_all_fields() {
        let stats = EngineStats::default();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        for key in [
            "packets_received",
            "packets_dropped",
            "packets_sent",
            "frames_processed",
            "utterances_emitted",
            "stage_failures",
            "transcodes_performed",
            "conversations_created",
            "conversations_ended",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
    }
}
