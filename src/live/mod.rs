//! Realtime voice-tutor turn orchestrator.
//!
//! Wires together a binary WebSocket framing layer (`wire`), per-connection
//! session state with a generation fence (`session`), a streaming STT
//! adapter (`stt`), a tool registry (`tools`), a primary/fallback LLM
//! adapter (`llm`), a structured-output enforcer (`enforcer`), the turn
//! orchestrator itself (`orchestrator`), a chunked TTS streamer (`tts`),
//! ring-buffer metrics (`metrics`), and the axum endpoint that dispatches
//! client frames to all of the above (`endpoint`).

pub mod config;
pub mod endpoint;
pub mod enforcer;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod orchestrator;
pub mod session;
pub mod stt;
pub mod tools;
pub mod tts;
pub mod wire;

pub use config::LiveConfig;
pub use endpoint::{LiveServer, LiveServices};
pub use error::{LiveError, Result as LiveResult};
pub use session::SessionState;
