//! Error types for the realtime voice-tutor turn orchestrator.

use crate::live::llm::LlmError;

/// Errors produced by the `live` subsystem.
///
/// Variants map directly onto the error-kind taxonomy the orchestrator
/// reasons about: which kinds are fatal to a session, which are scoped
/// to a single turn, and which are never user-visible at all.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    /// Malformed wire frame or unknown type byte. Fatal: send `ERROR`
    /// and close the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A turn or audio-queue budget was exceeded. Send `ERROR{code:413}`,
    /// discard the turn's buffered audio, leave the session/generation
    /// intact.
    #[error("budget exceeded: {0}")]
    OverBudget(String),

    /// Transport failure calling STT/LLM/TTS (timeout, 429, 5xx). Retried
    /// once via the LLM fallback model, or resolved with a canned
    /// utterance; never fatal to the session.
    #[error("upstream transient error: {0}")]
    UpstreamTransient(String),

    /// The model's structured response did not parse/validate. Always
    /// resolved internally by repair or deterministic coercion; never
    /// surfaced to the client.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// A tool call failed. Surfaced to the model as a `tool_result`
    /// error and counted as a tool failure.
    #[error("tool execution error: {0}")]
    ToolExecution(String),

    /// Errors bubbling up from the LLM provider adapter.
    #[error(transparent)]
    Llm(#[from] LlmError),
}

impl LiveError {
    /// Whether this error is fatal to the whole session, vs. scoped to a
    /// single turn.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// The wire `ERROR` frame code to report to the client, if any.
    pub fn wire_code(&self) -> Option<u32> {
        match self {
            Self::OverBudget(_) => Some(413),
            Self::Protocol(_) => Some(400),
            _ => None,
        }
    }
}

/// Convenience alias for `live` subsystem results.
pub type Result<T> = std::result::Result<T, LiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_fatal() {
        assert!(LiveError::Protocol("bad frame".into()).is_fatal());
    }

    #[test]
    fn over_budget_is_not_fatal() {
        assert!(!LiveError::OverBudget("turn too long".into()).is_fatal());
    }

    #[test]
    fn over_budget_reports_413() {
        assert_eq!(
            LiveError::OverBudget("turn too long".into()).wire_code(),
            Some(413)
        );
    }

    #[test]
    fn schema_violation_has_no_wire_code() {
        assert_eq!(LiveError::SchemaViolation("bad json".into()).wire_code(), None);
    }

    #[test]
    fn llm_error_converts_via_from() {
        let inner = LlmError::Timeout("20s elapsed".into());
        let wrapped: LiveError = inner.into();
        assert!(matches!(wrapped, LiveError::Llm(_)));
    }
}
