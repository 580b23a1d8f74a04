//! Per-call instructions
//!
//! A configuration value object fixed at call creation. It stays immutable
//! for the call lifetime unless an explicit `UpdateInstructions` event is
//! processed by the call's event loop.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// What the agent should do on this particular call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallInstructions {
    /// System prompt seeding the conversation
    pub system_prompt: String,
    /// BCP-47 language tag for STT/TTS
    pub language: String,
    /// TTS voice identifier
    pub voice: String,
    /// Hard ceiling on call duration in seconds
    pub max_call_duration_s: u64,
    /// Continuous non-speech tolerated before timing out, seconds
    pub silence_timeout_s: u64,
    /// How long to wait for a model response before recovering, seconds
    pub response_timeout_s: u64,
    /// Whether the switch should record the call (hook; recording itself is
    /// external)
    pub recording: bool,
    /// Whether transcripts are kept on the conversation
    pub transcription: bool,
    /// Transfer destination for the transfer hook
    pub transfer_target: Option<String>,
    /// Free-form metadata propagated to bus envelopes
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Default for CallInstructions {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful voice assistant. Keep answers short and \
                            conversational."
                .to_string(),
            language: "en-US".to_string(),
            voice: "alloy".to_string(),
            max_call_duration_s: 30 * 60,
            silence_timeout_s: 30,
            response_timeout_s: 30,
            recording: false,
            transcription: true,
            transfer_target: None,
            metadata: HashMap::new(),
        }
    }
}
