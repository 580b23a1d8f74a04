//! Model backends
//!
//! Each worker talks to its model through a narrow trait; concrete
//! backends are selected statically with a small tagged enum from config.
//! The HTTP backends speak to external model servers; the static backends
//! produce canned output for development and tests.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::ChatMessage;

/// STT backend result
#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub confidence: f32,
}

/// LLM backend result
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[async_trait]
pub trait SttBackend: Send + Sync {
    async fn transcribe(
        &self,
        audio: &[u8],
        sample_rate: u32,
        language: &str,
    ) -> Result<Transcription>;
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Complete a chat. When `deltas` is provided the backend may stream
    /// partial output through it before returning the full completion.
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
        deltas: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Completion>;
}

#[async_trait]
pub trait TtsBackend: Send + Sync {
    /// Synthesize linear PCM at the requested rate
    async fn synthesize(&self, text: &str, voice: &str, sample_rate: u32) -> Result<Vec<i16>>;
}

/// Backend selection, one tag per implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// External model server over HTTP
    Http,
    /// Canned in-process output (development / tests)
    Static,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Http
    }
}

// ---------------------------------------------------------------------------
// HTTP backends
// ---------------------------------------------------------------------------

/// Speech-to-text over a transcription server
pub struct HttpSttBackend {
    client: reqwest::Client,
    url: String,
}

impl HttpSttBackend {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[derive(Deserialize)]
struct SttResponse {
    text: String,
    #[serde(default)]
    confidence: Option<f32>,
}

#[async_trait]
impl SttBackend for HttpSttBackend {
    async fn transcribe(
        &self,
        audio: &[u8],
        sample_rate: u32,
        language: &str,
    ) -> Result<Transcription> {
        let response = self
            .client
            .post(&self.url)
            .query(&[
                ("sample_rate", sample_rate.to_string()),
                ("language", language.to_string()),
            ])
            .header("content-type", "application/octet-stream")
            .body(audio.to_vec())
            .send()
            .await
            .context("STT request failed")?;

        if !response.status().is_success() {
            bail!("STT server returned {}", response.status());
        }

        let parsed: SttResponse = response.json().await.context("invalid STT response")?;
        Ok(Transcription {
            text: parsed.text,
            confidence: parsed.confidence.unwrap_or(1.0),
        })
    }
}

/// Chat completion over an OpenAI-style endpoint
pub struct HttpLlmBackend {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpLlmBackend {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            api_key,
        }
    }

    fn request(&self) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(&self.url);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatStreamChunk {
    choices: Vec<ChatStreamChoice>,
}

#[derive(Deserialize)]
struct ChatStreamChoice {
    delta: ChatStreamDelta,
}

#[derive(Deserialize, Default)]
struct ChatStreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl LlmBackend for HttpLlmBackend {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
        deltas: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Completion> {
        let streaming = deltas.is_some();
        let body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": max_tokens,
            "temperature": temperature,
            "stream": streaming,
        });

        let response = self
            .request()
            .json(&body)
            .send()
            .await
            .context("LLM request failed")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("LLM server returned {status}: {detail}");
        }

        if let Some(deltas) = deltas {
            // Server-sent events: lines of `data: {json}` ending with
            // `data: [DONE]`
            let mut text = String::new();
            let mut buffer = String::new();
            let mut stream = response.bytes_stream();

            while let Some(chunk) = stream.next().await {
                let chunk = chunk.context("LLM stream interrupted")?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);

                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        continue;
                    }
                    if let Ok(chunk) = serde_json::from_str::<ChatStreamChunk>(data) {
                        for choice in chunk.choices {
                            if let Some(content) = choice.delta.content {
                                text.push_str(&content);
                                let _ = deltas.send(content);
                            }
                        }
                    }
                }
            }

            debug!(chars = text.len(), "LLM stream complete");
            Ok(Completion {
                completion_tokens: crate::conversation::estimate_tokens(&text),
                prompt_tokens: 0,
                text,
            })
        } else {
            let parsed: ChatResponse = response.json().await.context("invalid LLM response")?;
            let text = parsed
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .unwrap_or_default();
            let usage = parsed.usage.unwrap_or_default();
            Ok(Completion {
                text,
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            })
        }
    }
}

/// Synthesis over a TTS server that answers with a WAV body
pub struct HttpTtsBackend {
    client: reqwest::Client,
    url: String,
}

impl HttpTtsBackend {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl TtsBackend for HttpTtsBackend {
    async fn synthesize(&self, text: &str, voice: &str, sample_rate: u32) -> Result<Vec<i16>> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "text": text,
                "voice": voice,
                "sample_rate": sample_rate,
            }))
            .send()
            .await
            .context("TTS request failed")?;

        if !response.status().is_success() {
            bail!("TTS server returned {}", response.status());
        }

        let bytes = response.bytes().await?;
        let reader = hound::WavReader::new(std::io::Cursor::new(bytes.to_vec()))
            .context("TTS server returned invalid WAV")?;
        let samples: std::result::Result<Vec<i16>, _> =
            reader.into_samples::<i16>().collect();
        Ok(samples?)
    }
}

// ---------------------------------------------------------------------------
// Static backends (development / tests)
// ---------------------------------------------------------------------------

/// Returns a fixed transcription for any audio
pub struct StaticSttBackend {
    pub text: String,
    pub confidence: f32,
}

#[async_trait]
impl SttBackend for StaticSttBackend {
    async fn transcribe(&self, _: &[u8], _: u32, _: &str) -> Result<Transcription> {
        Ok(Transcription {
            text: self.text.clone(),
            confidence: self.confidence,
        })
    }
}

/// Echoes the last user message back
pub struct StaticLlmBackend;

#[async_trait]
impl LlmBackend for StaticLlmBackend {
    async fn complete(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _max_tokens: u32,
        _temperature: f32,
        deltas: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Completion> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == crate::types::Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let text = format!("You said: {last_user}");
        if let Some(deltas) = deltas {
            let _ = deltas.send(text.clone());
        }
        Ok(Completion {
            completion_tokens: crate::conversation::estimate_tokens(&text),
            prompt_tokens: messages
                .iter()
                .map(|m| crate::conversation::estimate_tokens(&m.content))
                .sum(),
            text,
        })
    }
}

/// Produces a quiet tone scaled to the text length
pub struct StaticTtsBackend;

#[async_trait]
impl TtsBackend for StaticTtsBackend {
    async fn synthesize(&self, text: &str, _voice: &str, sample_rate: u32) -> Result<Vec<i16>> {
        // ~60 ms of audio per character, 250 ms minimum
        let ms = (text.chars().count() as u64 * 60).max(250);
        let n = (sample_rate as u64 * ms / 1000) as usize;
        Ok((0..n)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                ((2.0 * std::f32::consts::PI * 440.0 * t).sin() * 8000.0) as i16
            })
            .collect())
    }
}

/// Build an STT backend from config
pub fn make_stt_backend(kind: BackendKind, url: &str) -> Arc<dyn SttBackend> {
    match kind {
        BackendKind::Http => Arc::new(HttpSttBackend::new(url)),
        BackendKind::Static => Arc::new(StaticSttBackend {
            text: String::new(),
            confidence: 0.0,
        }),
    }
}

/// Build an LLM backend from config
pub fn make_llm_backend(kind: BackendKind, url: &str, api_key: Option<String>) -> Arc<dyn LlmBackend> {
    match kind {
        BackendKind::Http => Arc::new(HttpLlmBackend::new(url, api_key)),
        BackendKind::Static => Arc::new(StaticLlmBackend),
    }
}

/// Build a TTS backend from config
pub fn make_tts_backend(kind: BackendKind, url: &str) -> Arc<dyn TtsBackend> {
    match kind {
        BackendKind::Http => Arc::new(HttpTtsBackend::new(url)),
        BackendKind::Static => Arc::new(StaticTtsBackend),
    }
}
