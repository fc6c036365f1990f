//! Fae: realtime voice-tutor conversation backend.
//!
//! The crate exposes a single subsystem, `live`, built around a
//! generation-fenced turn orchestrator that bridges a binary WebSocket
//! framing layer to a streaming STT adapter, a primary/fallback LLM
//! provider, a structured-output enforcer, and a chunked TTS streamer.

pub mod config;
pub mod error;
pub mod live;
pub mod logging;

pub use config::SpeechConfig;
pub use error::{Result, SpeechError};
pub use live::{LiveConfig, LiveServer, LiveServices};
