//! Configuration for the realtime voice-tutor turn orchestrator.
//!
//! Follows the same `#[serde(default)]` + explicit `impl Default`
//! convention as the other nested configs in [`crate::config`].

use serde::{Deserialize, Serialize};

/// The tutor's target language for canned utterances and speakable text
/// templating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetLanguage {
    En,
    Ko,
}

impl Default for TargetLanguage {
    fn default() -> Self {
        Self::En
    }
}

/// Configuration for the `live` voice-tutor subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Default target language for newly-initialized sessions.
    pub target_language: TargetLanguage,
    /// Whether translator mode (rewrite-oriented grammar gating) is on by
    /// default.
    pub translator_mode: bool,
    /// Maximum buffered audio bytes per turn before a 413 is raised.
    pub max_audio_bytes: u64,
    /// Maximum turn duration in seconds before a 413 is raised.
    pub turn_max_seconds: u64,
    /// Silence duration (ms) that triggers STT endpointing.
    pub turn_silence_ms: u64,
    /// Transcript confidence below this triggers a clarification turn
    /// instead of calling the LLM.
    pub stt_confidence_threshold: f32,
    /// Wall-clock budget (ms) for a turn's model call when no image is
    /// attached.
    pub time_budget_ms: u64,
    /// Wall-clock budget (ms) for a turn's model call when an image is
    /// attached.
    pub image_time_budget_ms: u64,
    /// Max tokens requested per LLM call.
    pub llm_max_tokens: usize,
    /// Sampling temperature for LLM calls.
    pub llm_temperature: f64,
    /// Wall-clock timeout (ms) for a single LLM request (primary attempt).
    pub llm_request_timeout_ms: u64,
    /// Maximum tool-loop iterations per turn.
    pub tool_max_iters: u32,
    /// Per-tool-call timeout (ms), enforced by the orchestrator.
    pub tool_timeout_ms: u64,
    /// Whether structured-output enforcement runs bounded repair passes
    /// before falling back to deterministic coercion.
    pub strict_structured_mode: bool,
    /// Sample rate (Hz) of incoming `AUDIO_FRAME` PCM16.
    pub stt_sample_rate_hz: u32,
    /// Sample rate (Hz) of outgoing `AUDIO_CHUNK` PCM16.
    pub tts_sample_rate_hz: u32,
    /// Bounded audio queue capacity (frames), per session.
    pub audio_queue_capacity: usize,
    /// How long `close_and_restart_stream` waits for the STT worker to
    /// exit before giving up and leaving it to a future attempt (ms).
    pub stt_stream_close_wait_ms: u64,
    /// Ring-buffer size for per-turn latency metrics.
    pub metrics_ring_capacity: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            target_language: TargetLanguage::En,
            translator_mode: false,
            max_audio_bytes: 2_400_000,
            turn_max_seconds: 20,
            turn_silence_ms: 1_200,
            stt_confidence_threshold: 0.55,
            time_budget_ms: 8_000,
            image_time_budget_ms: 18_000,
            llm_max_tokens: 600,
            llm_temperature: 0.2,
            llm_request_timeout_ms: 20_000,
            tool_max_iters: 2,
            tool_timeout_ms: 3_000,
            strict_structured_mode: true,
            stt_sample_rate_hz: 16_000,
            tts_sample_rate_hz: 24_000,
            audio_queue_capacity: 100,
            stt_stream_close_wait_ms: 3_000,
            metrics_ring_capacity: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_option_list() {
        let config = LiveConfig::default();
        assert_eq!(config.max_audio_bytes, 2_400_000);
        assert_eq!(config.turn_max_seconds, 20);
        assert_eq!(config.turn_silence_ms, 1_200);
        assert!((config.stt_confidence_threshold - 0.55).abs() < f32::EPSILON);
        assert_eq!(config.time_budget_ms, 8_000);
        assert_eq!(config.image_time_budget_ms, 18_000);
        assert_eq!(config.llm_max_tokens, 600);
        assert!((config.llm_temperature - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.llm_request_timeout_ms, 20_000);
        assert_eq!(config.tool_max_iters, 2);
        assert_eq!(config.tool_timeout_ms, 3_000);
        assert!(config.strict_structured_mode);
        assert_eq!(config.stt_sample_rate_hz, 16_000);
        assert_eq!(config.tts_sample_rate_hz, 24_000);
        assert_eq!(config.audio_queue_capacity, 100);
    }

    #[test]
    fn target_language_serializes_lowercase() {
        let json = serde_json::to_string(&TargetLanguage::Ko).unwrap();
        assert_eq!(json, "\"ko\"");
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = LiveConfig::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        let parsed: LiveConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.max_audio_bytes, config.max_audio_bytes);
        assert_eq!(parsed.target_language, config.target_language);
    }

    #[test]
    fn missing_fields_fall_back_to_default_via_serde_default() {
        let parsed: LiveConfig = toml::from_str("turn_max_seconds = 30\n").expect("deserialize");
        assert_eq!(parsed.turn_max_seconds, 30);
        assert_eq!(parsed.max_audio_bytes, 2_400_000);
    }
}
