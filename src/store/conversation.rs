//! Conversation persistence
//!
//! Key-value rows `conversation:<call_id>` holding the conversation JSON
//! body with a TTL (default one hour). Backed by SQLite in WAL mode behind
//! an async mutex; a background sweep purges expired rows.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::conversation::Conversation;
use crate::types::CallId;

/// SQLite-backed conversation store with row TTLs
pub struct ConversationStore {
    conn: Arc<Mutex<Connection>>,
    ttl_s: i64,
}

impl ConversationStore {
    pub async fn new<P: AsRef<Path>>(path: P, ttl: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("opening conversation store at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl_s: ttl.as_secs() as i64,
        })
    }

    /// In-memory store for tests and ephemeral deployments
    pub fn in_memory(ttl: Duration) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl_s: ttl.as_secs() as i64,
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                key TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_expiry
                ON conversations(expires_at);
            "#,
        )?;
        Ok(())
    }

    fn key(call_id: &CallId) -> String {
        format!("conversation:{call_id}")
    }

    /// Upsert the conversation body, refreshing its TTL
    pub async fn save(&self, conversation: &Conversation) -> Result<()> {
        let body = serde_json::to_string(conversation)?;
        let expires_at = Utc::now().timestamp() + self.ttl_s;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO conversations (key, body, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET body = ?2, expires_at = ?3",
            params![Self::key(&conversation.call_id), body, expires_at],
        )?;
        debug!(call_id = %conversation.call_id, "conversation saved");
        Ok(())
    }

    /// Load a conversation if present and unexpired
    pub async fn load(&self, call_id: &CallId) -> Result<Option<Conversation>> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().await;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM conversations WHERE key = ?1 AND expires_at > ?2",
                params![Self::key(call_id), now],
                |row| row.get(0),
            )
            .optional()?;

        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, call_id: &CallId) -> Result<bool> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "DELETE FROM conversations WHERE key = ?1",
            params![Self::key(call_id)],
        )?;
        Ok(affected > 0)
    }

    /// Purge expired rows; returns how many were removed
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM conversations WHERE expires_at <= ?1",
            params![now],
        )?;
        Ok(removed)
    }

    pub async fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Background TTL sweep until the engine shuts down
    pub fn spawn_sweeper(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.sweep_expired().await {
                            Ok(removed) if removed > 0 => {
                                info!(removed, "expired conversations swept");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::error!(error = %e, "conversation sweep failed");
                            }
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
    use crate::types::Role;

    fn conversation(call: &str) -> Conversation {
        let mut c = Conversation::new(CallId::from(call), "system prompt", 4000);
        c.add_message(Role::User, "hello");
        c.add_message(Role::Assistant, "hi, how can I help?");
        c
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let store = ConversationStore::in_memory(Duration::from_secs(3600)).unwrap();
        let original = conversation("c1");
        store.save(&original).await.unwrap();

        let mut loaded = store
            .load(&CallId::from("c1"))
            .await
            .unwrap()
            .expect("conversation should load");
        loaded.set_max_tokens(4000);

        assert_eq!(loaded.conversation_id, original.conversation_id);
        assert_eq!(loaded.messages.len(), 3);
        assert_eq!(loaded.total_tokens, original.total_tokens);
        assert_eq!(loaded.messages[0].role, Role::System);
    }

    #[tokio::test]
    async fn test_missing_returns_none() {
        let store = ConversationStore::in_memory(Duration::from_secs(3600)).unwrap();
        assert!(store.load(&CallId::from("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_is_upsert() {
        let store = ConversationStore::in_memory(Duration::from_secs(3600)).unwrap();
        let mut c = conversation("c1");
        store.save(&c).await.unwrap();
        c.add_message(Role::User, "more");
        store.save(&c).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let loaded = store.load(&CallId::from("c1")).await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 4);
    }

    #[tokio::test]
    async fn test_expired_rows_invisible_and_swept() {
        let store = ConversationStore::in_memory(Duration::from_secs(0)).unwrap();
        store.save(&conversation("c1")).await.unwrap();

        // TTL of zero: immediately expired
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(store.load(&CallId::from("c1")).await.unwrap().is_none());
        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = ConversationStore::in_memory(Duration::from_secs(3600)).unwrap();
        store.save(&conversation("c1")).await.unwrap();
        assert!(store.delete(&CallId::from("c1")).await.unwrap());
        assert!(!store.delete(&CallId::from("c1")).await.unwrap());
    }
}
