//! Model service workers
//!
//! One worker per model service (STT, LLM, TTS), each consuming its
//! request topic with bounded parallelism and publishing results back to
//! the bus. Backends are pluggable behind traits; health heartbeats go out
//! on `health.<worker>`.

pub mod backend;
pub mod health;
pub mod llm;
pub mod stt;
pub mod tts;

pub use backend::{
    make_llm_backend, make_stt_backend, make_tts_backend, BackendKind, Completion, LlmBackend,
    SttBackend, Transcription, TtsBackend,
};
pub use health::HealthTracker;
pub use llm::{spawn_llm_worker, LlmWorkerConfig};
pub use stt::{spawn_stt_worker, SttWorkerConfig};
pub use tts::{spawn_tts_worker, TtsWorkerConfig};
