//! Configuration management
//!
//! TOML-backed configuration with one section per subsystem and serde
//! defaults for every field, so a minimal (or missing) file yields a
//! working local setup. Secrets (switch password, LLM API key) can be
//! overridden from the environment.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::audio::Codec;
use crate::pipeline::noise::NoiseMode;
use crate::workers::BackendKind;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rtp: RtpConfig,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub vad: VadSection,
    #[serde(default)]
    pub echo: EchoSection,
    #[serde(default)]
    pub noise: NoiseSection,
    #[serde(default)]
    pub state_machine: StateMachineSection,
    #[serde(default)]
    pub conversation: ConversationSection,
    #[serde(default)]
    pub stt: SttSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub tts: TtsSection,
    #[serde(default)]
    pub bargein: BargeinSection,
    #[serde(default)]
    pub fallback: FallbackSection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub switch: SwitchSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpConfig {
    #[serde(default = "default_rtp_host")]
    pub host: String,
    /// Address the switch should send media to
    #[serde(default = "default_advertise_host")]
    pub advertise_host: String,
    #[serde(default = "default_port_low")]
    pub port_low: u16,
    #[serde(default = "default_port_high")]
    pub port_high: u16,
    /// Media codec offered for external media
    #[serde(default = "default_codec")]
    pub codec: Codec,
}

fn default_rtp_host() -> String {
    "0.0.0.0".to_string()
}

fn default_advertise_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port_low() -> u16 {
    10000
}

fn default_port_high() -> u16 {
    10999
}

fn default_codec() -> Codec {
    Codec::Pcmu
}

impl Default for RtpConfig {
    fn default() -> Self {
        Self {
            host: default_rtp_host(),
            advertise_host: default_advertise_host(),
            port_low: default_port_low(),
            port_high: default_port_high(),
            codec: default_codec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,
    #[serde(default = "default_min_utterance_ms")]
    pub min_utterance_ms: u64,
    #[serde(default = "default_max_utterance_ms")]
    pub max_utterance_ms: u64,
    /// Flush an open utterance after this much ingress silence
    #[serde(default = "default_silence_flush_ms")]
    pub silence_timeout_ms: u64,
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: usize,
}

fn default_frame_ms() -> u32 {
    20
}

fn default_min_utterance_ms() -> u64 {
    200
}

fn default_max_utterance_ms() -> u64 {
    15_000
}

fn default_silence_flush_ms() -> u64 {
    2000
}

fn default_max_memory_bytes() -> usize {
    1024 * 1024
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            frame_ms: default_frame_ms(),
            min_utterance_ms: default_min_utterance_ms(),
            max_utterance_ms: default_max_utterance_ms(),
            silence_timeout_ms: default_silence_flush_ms(),
            max_memory_bytes: default_max_memory_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadSection {
    #[serde(default = "default_k_in")]
    pub k_in: u32,
    #[serde(default = "default_k_out")]
    pub k_out: u32,
    #[serde(default = "default_vad_threshold_db")]
    pub threshold_db: f32,
    #[serde(default = "default_min_energy_db")]
    pub min_energy_db: f32,
    #[serde(default = "default_vad_confidence")]
    pub confidence_threshold: f32,
}

fn default_k_in() -> u32 {
    3
}

fn default_k_out() -> u32 {
    15
}

fn default_vad_threshold_db() -> f32 {
    12.0
}

fn default_min_energy_db() -> f32 {
    -45.0
}

fn default_vad_confidence() -> f32 {
    0.6
}

impl Default for VadSection {
    fn default() -> Self {
        Self {
            k_in: default_k_in(),
            k_out: default_k_out(),
            threshold_db: default_vad_threshold_db(),
            min_energy_db: default_min_energy_db(),
            confidence_threshold: default_vad_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoSection {
    #[serde(default = "default_echo_reference_ms")]
    pub reference_ms: u32,
}

fn default_echo_reference_ms() -> u32 {
    200
}

impl Default for EchoSection {
    fn default() -> Self {
        Self {
            reference_ms: default_echo_reference_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoiseSection {
    #[serde(default)]
    pub mode: NoiseMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachineSection {
    #[serde(default = "default_max_duration_s")]
    pub max_duration_s: u64,
    #[serde(default = "default_silence_timeout_s")]
    pub silence_timeout_s: u64,
    #[serde(default = "default_response_timeout_s")]
    pub response_timeout_s: u64,
}

fn default_max_duration_s() -> u64 {
    30 * 60
}

fn default_silence_timeout_s() -> u64 {
    30
}

fn default_response_timeout_s() -> u64 {
    30
}

impl Default for StateMachineSection {
    fn default() -> Self {
        Self {
            max_duration_s: default_max_duration_s(),
            silence_timeout_s: default_silence_timeout_s(),
            response_timeout_s: default_response_timeout_s(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSection {
    #[serde(default = "default_conversation_ttl_s")]
    pub ttl_s: u64,
    #[serde(default = "default_conversation_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_conversation_ttl_s() -> u64 {
    3600
}

fn default_conversation_max_tokens() -> u32 {
    4000
}

fn default_system_prompt() -> String {
    "You are a helpful voice assistant. Keep answers short and conversational.".to_string()
}

impl Default for ConversationSection {
    fn default() -> Self {
        Self {
            ttl_s: default_conversation_ttl_s(),
            max_tokens: default_conversation_max_tokens(),
            system_prompt: default_system_prompt(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttSection {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_stt_url")]
    pub url: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_stt_timeout_s")]
    pub request_timeout_s: u64,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

fn default_stt_url() -> String {
    "http://127.0.0.1:9001/transcribe".to_string()
}

fn default_language() -> String {
    "en-US".to_string()
}

fn default_stt_timeout_s() -> u64 {
    15
}

fn default_parallelism() -> usize {
    4
}

impl Default for SttSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            url: default_stt_url(),
            language: default_language(),
            request_timeout_s: default_stt_timeout_s(),
            parallelism: default_parallelism(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSection {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_llm_url")]
    pub url: String,
    /// Overridden by VOICEBRIDGE_LLM_API_KEY
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_primary_model")]
    pub primary_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
    #[serde(default = "default_llm_timeout_s")]
    pub request_timeout_s: u64,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

fn default_llm_url() -> String {
    "http://127.0.0.1:9002/v1/chat/completions".to_string()
}

fn default_primary_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_timeout_s() -> u64 {
    30
}

fn default_llm_max_tokens() -> u32 {
    256
}

fn default_llm_temperature() -> f32 {
    0.7
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            url: default_llm_url(),
            api_key: None,
            primary_model: default_primary_model(),
            fallback_model: None,
            request_timeout_s: default_llm_timeout_s(),
            max_tokens: default_llm_max_tokens(),
            temperature: default_llm_temperature(),
            streaming: false,
            parallelism: default_parallelism(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsSection {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_tts_url")]
    pub url: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_tts_ttl_s")]
    pub artifact_ttl_s: u64,
    #[serde(default = "default_tts_timeout_s")]
    pub request_timeout_s: u64,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

fn default_tts_url() -> String {
    "http://127.0.0.1:9003/synthesize".to_string()
}

fn default_voice() -> String {
    "alloy".to_string()
}

fn default_tts_ttl_s() -> u64 {
    300
}

fn default_tts_timeout_s() -> u64 {
    20
}

impl Default for TtsSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            url: default_tts_url(),
            voice: default_voice(),
            artifact_ttl_s: default_tts_ttl_s(),
            request_timeout_s: default_tts_timeout_s(),
            parallelism: default_parallelism(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BargeinSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bargein_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_bargein_confidence")]
    pub confidence_threshold: f32,
}

fn default_true() -> bool {
    true
}

fn default_bargein_debounce_ms() -> u64 {
    150
}

fn default_bargein_confidence() -> f32 {
    0.6
}

impl Default for BargeinSection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            debounce_ms: default_bargein_debounce_ms(),
            confidence_threshold: default_bargein_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub greeting_enabled: bool,
    /// Optional JSON file overriding the scripted templates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub templates_path: Option<PathBuf>,
}

impl Default for FallbackSection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            greeting_enabled: false,
            templates_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSection {
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

fn default_inbox_capacity() -> usize {
    256
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchSection {
    #[serde(default = "default_switch_url")]
    pub base_url: String,
    #[serde(default = "default_switch_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_switch_user")]
    pub username: String,
    /// Overridden by VOICEBRIDGE_SWITCH_PASSWORD
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

fn default_switch_url() -> String {
    "http://127.0.0.1:8089/api".to_string()
}

fn default_switch_ws_url() -> String {
    "ws://127.0.0.1:8089/api/events".to_string()
}

fn default_switch_user() -> String {
    "voicebridge".to_string()
}

fn default_app_name() -> String {
    "voicebridge".to_string()
}

impl Default for SwitchSection {
    fn default() -> Self {
        Self {
            base_url: default_switch_url(),
            ws_url: default_switch_ws_url(),
            username: default_switch_user(),
            password: String::new(),
            app_name: default_app_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Shared directory the switch can read artifacts from
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/voicebridge.db")
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("data/artifacts")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            artifact_dir: default_artifact_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8088
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

impl Config {
    /// Load from an explicit path, or from the default location, falling
    /// back to defaults when no file exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_path()?,
        };

        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("parsing config {}", path.display()))?
        } else {
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Secrets from the environment beat the file
    fn apply_env_overrides(&mut self) {
        if let Ok(password) = std::env::var("VOICEBRIDGE_SWITCH_PASSWORD") {
            self.switch.password = password;
        }
        if let Ok(key) = std::env::var("VOICEBRIDGE_LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.rtp.port_low > self.rtp.port_high {
            anyhow::bail!(
                "rtp.port_range is inverted: {} > {}",
                self.rtp.port_low,
                self.rtp.port_high
            );
        }
        if self.pipeline.min_utterance_ms >= self.pipeline.max_utterance_ms {
            anyhow::bail!("pipeline.min_utterance_ms must be below max_utterance_ms");
        }
        if !(0.0..=1.0).contains(&self.bargein.confidence_threshold) {
            anyhow::bail!("bargein.confidence_threshold must be within [0, 1]");
        }
        Ok(())
    }

    /// The default configuration rendered as TOML
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default())
            .unwrap_or_else(|_| "# default configuration\n".to_string())
    }
}

/// Default config file location
pub fn default_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("VOICEBRIDGE_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    let base = directories::ProjectDirs::from("dev", "voicebridge", "voicebridge")
        .context("resolving project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rtp.port_low, 10000);
        assert_eq!(config.vad.k_in, 3);
        assert_eq!(config.vad.k_out, 15);
        assert_eq!(config.state_machine.max_duration_s, 1800);
        assert_eq!(config.conversation.ttl_s, 3600);
        assert_eq!(config.tts.artifact_ttl_s, 300);
        assert!(config.bargein.enabled);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [rtp]
            port_low = 20000
            port_high = 20100

            [llm]
            primary_model = "llama-3.1-8b"
            fallback_model = "phi-3-mini"
            "#,
        )
        .unwrap();

        assert_eq!(config.rtp.port_low, 20000);
        assert_eq!(config.llm.primary_model, "llama-3.1-8b");
        assert_eq!(config.llm.fallback_model.as_deref(), Some("phi-3-mini"));
        // Untouched sections keep their defaults
        assert_eq!(config.vad.k_out, 15);
        assert_eq!(config.switch.username, "voicebridge");
    }

    #[test]
    fn test_default_toml_round_trips() {
        let rendered = Config::default_toml();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_inverted_ports() {
        let mut config = Config::default();
        config.rtp.port_low = 3000;
        config.rtp.port_high = 2000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_noise_mode_parses() {
        let config: Config = toml::from_str("[noise]\nmode = \"aggressive\"\n").unwrap();
        assert_eq!(config.noise.mode, NoiseMode::Aggressive);
    }
}
