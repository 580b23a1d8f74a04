//! TTS artifact storage
//!
//! Synthesized audio is persisted as WAV files on a directory the switch
//! can read, and referenced everywhere else by an opaque handle. Artifacts
//! expire after a TTL (default 5 minutes) or when their call tears down,
//! whichever comes first; a background sweep deletes expired files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::CallId;

/// Record describing one synthesized-audio artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsArtifact {
    pub artifact_id: String,
    /// Opaque locator the switch can play from (filesystem path here)
    pub handle: String,
    pub duration_ms: u64,
    pub byte_length: u64,
    pub sample_rate: u32,
    pub encoding: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub call_id: CallId,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ArtifactStats {
    pub files_written: u64,
    pub files_deleted: u64,
    pub files_expired: u64,
    pub bytes_written: u64,
}

/// Directory-backed artifact manager
pub struct ArtifactStore {
    base_dir: PathBuf,
    ttl: Duration,
    index: Mutex<HashMap<String, TtsArtifact>>,
    stats: Mutex<ArtifactStats>,
}

impl ArtifactStore {
    pub fn new(base_dir: impl AsRef<Path>, ttl: Duration) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)
            .with_context(|| format!("creating artifact directory {}", base_dir.display()))?;
        Ok(Self {
            base_dir,
            ttl,
            index: Mutex::new(HashMap::new()),
            stats: Mutex::new(ArtifactStats::default()),
        })
    }

    /// Persist linear PCM as a WAV artifact
    pub fn save_wav(
        &self,
        call_id: &CallId,
        samples: &[i16],
        sample_rate: u32,
    ) -> Result<TtsArtifact> {
        let artifact_id = Uuid::new_v4().to_string();
        let path = self.base_dir.join(format!("{artifact_id}.wav"));

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec)
            .with_context(|| format!("creating WAV at {}", path.display()))?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;

        let byte_length = std::fs::metadata(&path)?.len();
        let now = Utc::now();
        let artifact = TtsArtifact {
            artifact_id: artifact_id.clone(),
            handle: path.to_string_lossy().into_owned(),
            duration_ms: samples.len() as u64 * 1000 / sample_rate as u64,
            byte_length,
            sample_rate,
            encoding: "wav".to_string(),
            created_at: now,
            expires_at: now + chrono::Duration::from_std(self.ttl).unwrap_or_default(),
            call_id: call_id.clone(),
        };

        self.index
            .lock()
            .unwrap()
            .insert(artifact_id, artifact.clone());
        let mut stats = self.stats.lock().unwrap();
        stats.files_written += 1;
        stats.bytes_written += byte_length;

        debug!(
            call_id = %call_id,
            artifact_id = %artifact.artifact_id,
            bytes = byte_length,
            duration_ms = artifact.duration_ms,
            "artifact written"
        );
        Ok(artifact)
    }

    /// Read an artifact back as linear PCM (for egress streaming)
    pub fn read_pcm(&self, artifact_id: &str) -> Result<Vec<i16>> {
        let artifact = self
            .get(artifact_id)
            .with_context(|| format!("unknown artifact {artifact_id}"))?;
        let mut reader = hound::WavReader::open(&artifact.handle)
            .with_context(|| format!("opening artifact {}", artifact.handle))?;
        let samples: std::result::Result<Vec<i16>, _> = reader.samples::<i16>().collect();
        Ok(samples?)
    }

    pub fn get(&self, artifact_id: &str) -> Option<TtsArtifact> {
        self.index.lock().unwrap().get(artifact_id).cloned()
    }

    /// Delete one artifact and its file
    pub fn delete(&self, artifact_id: &str) -> bool {
        let artifact = self.index.lock().unwrap().remove(artifact_id);
        match artifact {
            Some(artifact) => {
                if let Err(e) = std::fs::remove_file(&artifact.handle) {
                    warn!(artifact_id, error = %e, "failed to remove artifact file");
                }
                self.stats.lock().unwrap().files_deleted += 1;
                true
            }
            None => false,
        }
    }

    /// Drop everything belonging to a terminated call
    pub fn delete_for_call(&self, call_id: &CallId) -> usize {
        let ids: Vec<String> = {
            let index = self.index.lock().unwrap();
            index
                .values()
                .filter(|a| &a.call_id == call_id)
                .map(|a| a.artifact_id.clone())
                .collect()
        };
        let count = ids.len();
        for id in ids {
            self.delete(&id);
        }
        if count > 0 {
            debug!(%call_id, count, "removed call artifacts");
        }
        count
    }

    /// Remove everything past its expiry; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = {
            let index = self.index.lock().unwrap();
            index
                .values()
                .filter(|a| a.expires_at <= now)
                .map(|a| a.artifact_id.clone())
                .collect()
        };
        let count = expired.len();
        for id in expired {
            self.delete(&id);
            self.stats.lock().unwrap().files_expired += 1;
        }
        count
    }

    pub fn stats(&self) -> ArtifactStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn active_count(&self) -> usize {
        self.index.lock().unwrap().len()
    }

    /// Background expiry sweep until the engine shuts down
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.sweep_expired();
                        if removed > 0 {
                            info!(removed, "expired artifacts swept");
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
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(ttl: Duration) -> (ArtifactStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), ttl).unwrap();
        (store, dir)
    }

    fn tone(ms: u64) -> Vec<i16> {
        let n = (8000 * ms / 1000) as usize;
        (0..n).map(|i| ((i as f32 * 0.5).sin() * 8000.0) as i16).collect()
    }

    #[test]
    fn test_save_and_read_round_trip() {
        let (store, _dir) = store(Duration::from_secs(300));
        let samples = tone(100);
        let artifact = store
            .save_wav(&CallId::from("c1"), &samples, 8000)
            .unwrap();

        assert_eq!(artifact.duration_ms, 100);
        assert_eq!(artifact.sample_rate, 8000);
        assert_eq!(artifact.encoding, "wav");
        assert!(artifact.expires_at > artifact.created_at);
        assert!(Path::new(&artifact.handle).exists());

        let back = store.read_pcm(&artifact.artifact_id).unwrap();
        assert_eq!(back, samples);
    }

    #[test]
    fn test_delete_removes_file() {
        let (store, _dir) = store(Duration::from_secs(300));
        let artifact = store
            .save_wav(&CallId::from("c1"), &tone(20), 8000)
            .unwrap();
        let path = artifact.handle.clone();

        assert!(store.delete(&artifact.artifact_id));
        assert!(!Path::new(&path).exists());
        assert!(store.get(&artifact.artifact_id).is_none());
        // Double delete is a no-op
        assert!(!store.delete(&artifact.artifact_id));
    }

    #[test]
    fn test_delete_for_call() {
        let (store, _dir) = store(Duration::from_secs(300));
        store.save_wav(&CallId::from("a"), &tone(20), 8000).unwrap();
        store.save_wav(&CallId::from("a"), &tone(20), 8000).unwrap();
        store.save_wav(&CallId::from("b"), &tone(20), 8000).unwrap();

        assert_eq!(store.delete_for_call(&CallId::from("a")), 2);
        assert_eq!(store.active_count(), 1);
    }

    #[test]
    fn test_sweep_expired() {
        let (store, _dir) = store(Duration::from_millis(0));
        store.save_wav(&CallId::from("c"), &tone(20), 8000).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.active_count(), 0);
        assert_eq!(store.stats().files_expired, 1);
    }

    #[test]
    fn test_stats_accumulate() {
        let (store, _dir) = store(Duration::from_secs(300));
        store.save_wav(&CallId::from("c"), &tone(20), 8000).unwrap();
        let stats = store.stats();
        assert_eq!(stats.files_written, 1);
        assert!(stats.bytes_written > 0);
    }
}
