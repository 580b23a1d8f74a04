//! Switch control client
//!
//! HTTP client for the telephony switch's control API (Basic auth).
//! Transient 5xx failures retry with exponential backoff; hangup and
//! stop-playback are idempotent — a channel that is already gone counts
//! as success, so teardown can never fail the orchestrator.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::types::ChannelId;

/// Retry schedule for transient switch errors
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_ATTEMPTS: u32 = 3;

/// Out-of-band control surface the orchestrator drives
#[async_trait]
pub trait SwitchControl: Send + Sync {
    /// Answer an offered channel
    async fn answer(&self, channel: &ChannelId) -> Result<()>;
    /// Ask the switch to establish external media toward our RTP port
    async fn start_external_media(
        &self,
        channel: &ChannelId,
        host: &str,
        port: u16,
        format: &str,
    ) -> Result<()>;
    /// Play an artifact by handle
    async fn play(&self, channel: &ChannelId, handle: &str) -> Result<()>;
    /// Stop whatever is playing. Idempotent.
    async fn stop_playback(&self, channel: &ChannelId) -> Result<()>;
    /// Hang the channel up. Idempotent: hanging up a gone channel succeeds.
    async fn hangup(&self, channel: &ChannelId) -> Result<()>;
    /// Speak text with the switch's built-in synthesis (last-resort path)
    async fn say(&self, channel: &ChannelId, text: &str) -> Result<()>;
    /// Enumerate active channels
    async fn list_channels(&self) -> Result<Vec<ChannelId>>;
    /// Originate an outbound call (hook; dial-plan logic is external)
    async fn originate(&self, endpoint: &str) -> Result<ChannelId>;
    /// Originate a snoop channel for media duplication (hook)
    async fn snoop(&self, channel: &ChannelId) -> Result<ChannelId>;
}

#[derive(Debug, Clone)]
pub struct SwitchClientConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub app_name: String,
}

/// reqwest-backed implementation of the control surface
pub struct HttpSwitchClient {
    client: reqwest::Client,
    config: SwitchClientConfig,
}

#[derive(Deserialize)]
struct ChannelEntry {
    id: String,
}

impl HttpSwitchClient {
    pub fn new(config: SwitchClientConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// POST with Basic auth and 5xx retry; 404 tolerance is the caller's
    /// decision.
    async fn post(
        &self,
        path: &str,
        body: Option<serde_json::Value>,
        tolerate_missing: bool,
    ) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            let mut request = self
                .client
                .post(self.url(path))
                .basic_auth(&self.config.username, Some(&self.config.password));
            if let Some(body) = &body {
                request = request.json(body);
            }

            let response = request.send().await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    if status == StatusCode::NOT_FOUND && tolerate_missing {
                        debug!(path, "target already gone, treating as success");
                        return Ok(());
                    }
                    if status.is_server_error() && attempt + 1 < RETRY_ATTEMPTS {
                        attempt += 1;
                        let backoff = RETRY_BASE * 2u32.pow(attempt - 1);
                        warn!(path, %status, attempt, "switch 5xx, retrying");
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    bail!("switch returned {status} for {path}");
                }
                Err(e) if attempt + 1 < RETRY_ATTEMPTS => {
                    attempt += 1;
                    let backoff = RETRY_BASE * 2u32.pow(attempt - 1);
                    warn!(path, error = %e, attempt, "switch unreachable, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e).context(format!("switch request {path} failed")),
            }
        }
    }
}

#[async_trait]
impl SwitchControl for HttpSwitchClient {
    async fn answer(&self, channel: &ChannelId) -> Result<()> {
        self.post(&format!("channels/{channel}/answer"), None, false)
            .await
    }

    async fn start_external_media(
        &self,
        channel: &ChannelId,
        host: &str,
        port: u16,
        format: &str,
    ) -> Result<()> {
        self.post(
            &format!("channels/{channel}/external_media"),
            Some(json!({
                "app": self.config.app_name,
                "external_host": format!("{host}:{port}"),
                "format": format,
            })),
            false,
        )
        .await
    }

    async fn play(&self, channel: &ChannelId, handle: &str) -> Result<()> {
        self.post(
            &format!("channels/{channel}/play"),
            Some(json!({ "media": format!("sound:{handle}") })),
            false,
        )
        .await
    }

    async fn stop_playback(&self, channel: &ChannelId) -> Result<()> {
        self.post(&format!("channels/{channel}/play/stop"), None, true)
            .await
    }

    async fn hangup(&self, channel: &ChannelId) -> Result<()> {
        self.post(&format!("channels/{channel}/hangup"), None, true)
            .await
    }

    async fn say(&self, channel: &ChannelId, text: &str) -> Result<()> {
        self.post(
            &format!("channels/{channel}/say"),
            Some(json!({ "text": text })),
            false,
        )
        .await
    }

    async fn list_channels(&self) -> Result<Vec<ChannelId>> {
        let response = self
            .client
            .get(self.url("channels"))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await
            .context("listing channels")?;
        if !response.status().is_success() {
            bail!("switch returned {} listing channels", response.status());
        }
        let entries: Vec<ChannelEntry> = response.json().await?;
        Ok(entries
            .into_iter()
            .map(|e| ChannelId(e.id))
            .collect())
    }

    async fn originate(&self, endpoint: &str) -> Result<ChannelId> {
        let response = self
            .client
            .post(self.url("channels"))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(&json!({ "endpoint": endpoint, "app": self.config.app_name }))
            .send()
            .await
            .context("originating channel")?;
        if !response.status().is_success() {
            bail!("switch returned {} originating", response.status());
        }
        let entry: ChannelEntry = response.json().await?;
        Ok(ChannelId(entry.id))
    }

    async fn snoop(&self, channel: &ChannelId) -> Result<ChannelId> {
        let response = self
            .client
            .post(self.url(&format!("channels/{channel}/snoop")))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(&json!({ "app": self.config.app_name, "spy": "in" }))
            .send()
            .await
            .context("creating snoop channel")?;
        if !response.status().is_success() {
            bail!("switch returned {} snooping", response.status());
        }
        let entry: ChannelEntry = response.json().await?;
        Ok(ChannelId(entry.id))
    }
}
