//! Error types for the fae crate.

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Realtime voice-tutor turn orchestrator error.
    #[error("live error: {0}")]
    Live(String),
}

impl From<crate::live::error::LiveError> for SpeechError {
    fn from(err: crate::live::error::LiveError) -> Self {
        Self::Live(err.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SpeechError>;
