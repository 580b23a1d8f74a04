//! Engine assembly
//!
//! Builds every subsystem from the configuration and wires them together:
//! stores, bus, port pool, correlation map, model workers, switch client
//! and event stream, orchestrator dispatchers and the status server. One
//! shutdown signal tears the whole thing down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::bus::Bus;
use crate::call::{CallInstructions, CallRegistry};
use crate::config::Config;
use crate::orchestrator::{FallbackResponses, Orchestrator, OrchestratorConfig};
use crate::pipeline::utterance::UtteranceConfig;
use crate::pipeline::vad::VadConfig;
use crate::pipeline::PipelineConfig;
use crate::rtp::{CorrelationMap, PortPool};
use crate::stats::EngineStats;
use crate::store::{ArtifactStore, ConversationStore};
use crate::switch::{self, HttpSwitchClient, SwitchClientConfig, SwitchControl};
use crate::workers::{
    self, LlmWorkerConfig, SttWorkerConfig, TtsWorkerConfig,
};

/// Background sweep cadence for both stores
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A running voicebridge instance
pub struct Engine {
    pub orchestrator: Arc<Orchestrator>,
    shutdown: watch::Sender<bool>,
}

impl Engine {
    /// Build and start everything.
    pub async fn start(config: Config) -> Result<Self> {
        let switch: Arc<dyn SwitchControl> = Arc::new(HttpSwitchClient::new(SwitchClientConfig {
            base_url: config.switch.base_url.clone(),
            username: config.switch.username.clone(),
            password: config.switch.password.clone(),
            app_name: config.switch.app_name.clone(),
        }));
        Self::start_with_switch(config, switch).await
    }

    /// Start with a caller-provided switch client (tests inject a mock).
    pub async fn start_with_switch(
        config: Config,
        switch: Arc<dyn SwitchControl>,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let bus = Arc::new(Bus::with_capacity(config.bus.inbox_capacity));
        let registry = Arc::new(CallRegistry::new());
        let ports = Arc::new(PortPool::new(config.rtp.port_low, config.rtp.port_high));
        let correlation = Arc::new(CorrelationMap::new());
        let engine_stats = Arc::new(EngineStats::default());

        let artifacts = Arc::new(
            ArtifactStore::new(
                &config.store.artifact_dir,
                Duration::from_secs(config.tts.artifact_ttl_s),
            )
            .context("artifact store")?,
        );
        artifacts
            .clone()
            .spawn_sweeper(SWEEP_INTERVAL, shutdown_rx.clone());

        let conversations = Arc::new(
            ConversationStore::new(
                &config.store.db_path,
                Duration::from_secs(config.conversation.ttl_s),
            )
            .await
            .context("conversation store")?,
        );
        conversations
            .clone()
            .spawn_sweeper(SWEEP_INTERVAL, shutdown_rx.clone());

        let fallback = Arc::new(match &config.fallback.templates_path {
            Some(path) => FallbackResponses::load_from_json(path)?,
            None => FallbackResponses::new(),
        });

        // Model workers
        workers::spawn_stt_worker(
            bus.clone(),
            workers::make_stt_backend(config.stt.backend, &config.stt.url),
            SttWorkerConfig {
                parallelism: config.stt.parallelism,
                request_timeout: Duration::from_secs(config.stt.request_timeout_s),
                ..Default::default()
            },
            shutdown_rx.clone(),
        );
        workers::spawn_llm_worker(
            bus.clone(),
            workers::make_llm_backend(
                config.llm.backend,
                &config.llm.url,
                config.llm.api_key.clone(),
            ),
            LlmWorkerConfig {
                parallelism: config.llm.parallelism,
                request_timeout: Duration::from_secs(config.llm.request_timeout_s),
                primary_model: config.llm.primary_model.clone(),
                fallback_model: config.llm.fallback_model.clone(),
                streaming: config.llm.streaming,
                ..Default::default()
            },
            shutdown_rx.clone(),
        );
        workers::spawn_tts_worker(
            bus.clone(),
            workers::make_tts_backend(config.tts.backend, &config.tts.url),
            artifacts.clone(),
            TtsWorkerConfig {
                parallelism: config.tts.parallelism,
                request_timeout: Duration::from_secs(config.tts.request_timeout_s),
                ..Default::default()
            },
            shutdown_rx.clone(),
        );

        let orchestrator = Arc::new(Orchestrator {
            config: Arc::new(orchestrator_config(&config)),
            bus: bus.clone(),
            registry: registry.clone(),
            ports,
            correlation,
            artifacts,
            conversations,
            switch,
            fallback,
            stats: engine_stats.clone(),
        });
        orchestrator.spawn_dispatchers(shutdown_rx.clone());

        // Switch event feed
        let (switch_events_tx, switch_events_rx) = mpsc::unbounded_channel();
        switch::spawn_event_stream(
            config.switch.ws_url.clone(),
            switch_events_tx,
            shutdown_rx.clone(),
        );
        orchestrator.spawn_switch_router(switch_events_rx, shutdown_rx.clone());

        // Status surface
        crate::server::spawn_server(
            &config.server.host,
            config.server.port,
            registry,
            orchestrator.artifacts.clone(),
            bus,
            engine_stats,
            shutdown_rx,
        )
        .await?;

        info!("engine started");
        Ok(Self {
            orchestrator,
            shutdown: shutdown_tx,
        })
    }

    /// Signal every task to stop.
    pub fn shutdown(&self) {
        info!("engine shutting down");
        let _ = self.shutdown.send(true);
    }
}

/// Project the file config onto the orchestrator's view
pub fn orchestrator_config(config: &Config) -> OrchestratorConfig {
    OrchestratorConfig {
        bind_host: config.rtp.host.clone(),
        advertise_host: config.rtp.advertise_host.clone(),
        codec: config.rtp.codec,
        pipeline: PipelineConfig {
            frame_ms: config.pipeline.frame_ms,
            echo_reference_ms: config.echo.reference_ms,
            noise_mode: config.noise.mode,
            vad: VadConfig {
                threshold_db: config.vad.threshold_db,
                min_energy_db: config.vad.min_energy_db,
                adaptation_rate: 0.05,
                adaptive_noise_floor: true,
            },
            utterance: UtteranceConfig {
                k_in: config.vad.k_in,
                k_out: config.vad.k_out,
                min_utterance_ms: config.pipeline.min_utterance_ms,
                max_utterance_ms: config.pipeline.max_utterance_ms,
                max_memory_bytes: config.pipeline.max_memory_bytes,
            },
        },
        default_instructions: CallInstructions {
            system_prompt: config.conversation.system_prompt.clone(),
            language: config.stt.language.clone(),
            voice: config.tts.voice.clone(),
            max_call_duration_s: config.state_machine.max_duration_s,
            silence_timeout_s: config.state_machine.silence_timeout_s,
            response_timeout_s: config.state_machine.response_timeout_s,
            ..Default::default()
        },
        conversation_max_tokens: config.conversation.max_tokens,
        llm_max_tokens: config.llm.max_tokens,
        llm_temperature: config.llm.temperature,
        utterance_confidence_threshold: config.vad.confidence_threshold,
        bargein_enabled: config.bargein.enabled,
        bargein_debounce_ms: config.bargein.debounce_ms,
        bargein_confidence_threshold: config.bargein.confidence_threshold,
        fallback_enabled: config.fallback.enabled,
        greeting_enabled: config.fallback.greeting_enabled,
        silence_flush_ms: config.pipeline.silence_timeout_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orchestrator_config_projection() {
        let mut config = Config::default();
        config.vad.k_in = 5;
        config.bargein.debounce_ms = 200;
        config.noise.mode = crate::pipeline::noise::NoiseMode::Aggressive;

        let projected = orchestrator_config(&config);
        assert_eq!(projected.pipeline.utterance.k_in, 5);
        assert_eq!(projected.bargein_debounce_ms, 200);
        assert_eq!(
            projected.pipeline.noise_mode,
            crate::pipeline::noise::NoiseMode::Aggressive
        );
        assert_eq!(projected.default_instructions.silence_timeout_s, 30);
    }
}
