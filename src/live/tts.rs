//! TTS streamer (C8): one synthesis call per turn, then fixed-size PCM16
//! chunk emission with per-chunk cancellation checks so barge-in can
//! interrupt promptly.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// ~200ms of 16-bit PCM at 24kHz.
pub const CHUNK_BYTES: usize = 9_600;

/// Small yield between chunk sends so the event loop gets a chance to
/// observe and act on a `BARGE_IN` promptly.
const INTER_CHUNK_YIELD: Duration = Duration::from_millis(10);

/// Errors from the TTS vendor adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TtsError {
    #[error("tts synthesis failed: {0}")]
    SynthesisFailed(String),
}

/// A vendor-agnostic full-utterance synthesizer. Concrete implementations
/// wrap a real TTS engine; tests use an in-memory double. This mirrors
/// the STT/LLM provider-adapter pattern: concrete vendors are kept
/// behind a trait rather than hard-wired.
#[async_trait]
pub trait TtsSynthesizer: Send + Sync {
    /// Synthesize the full utterance as raw PCM16 at the configured
    /// sample rate. One call per turn — the streamer chunks the result.
    async fn synthesize(&self, text: &str, language_code: &str) -> Result<Vec<u8>, TtsError>;
}

/// What the TTS streamer produced for one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// All chunks plus the completion marker were emitted.
    Completed,
    /// Cancelled before or during streaming; nothing further is emitted.
    Cancelled,
}

/// Stream synthesized speech in fixed-size chunks, invoking `on_chunk`
/// for each one and `on_complete` only if streaming wasn't cancelled.
/// Checks `cancel` before synthesis, before every chunk, and before the
/// completion callback.
pub async fn synthesize_and_stream(
    synthesizer: &dyn TtsSynthesizer,
    text: &str,
    language_code: &str,
    cancel: &CancellationToken,
    mut on_chunk: impl FnMut(&[u8]),
    on_complete: impl FnOnce(),
) -> Result<StreamOutcome, TtsError> {
    if cancel.is_cancelled() {
        return Ok(StreamOutcome::Cancelled);
    }

    let audio = synthesizer.synthesize(text, language_code).await?;

    if cancel.is_cancelled() {
        return Ok(StreamOutcome::Cancelled);
    }

    for chunk in audio.chunks(CHUNK_BYTES) {
        if cancel.is_cancelled() {
            return Ok(StreamOutcome::Cancelled);
        }
        on_chunk(chunk);
        tokio::time::sleep(INTER_CHUNK_YIELD).await;
    }

    if cancel.is_cancelled() {
        return Ok(StreamOutcome::Cancelled);
    }
    on_complete();
    Ok(StreamOutcome::Completed)
}

/// Selects the voice identifier to request from the vendor for a given
/// target language. Concrete vendor adapters consult this when building
/// their synthesis request.
pub fn voice_for_language(language_code: &str) -> &'static str {
    if language_code.starts_with("ko") {
        "ko-KR-Standard-A"
    } else {
        "en-US-Neural2-F"
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::ScriptedSynthesizer;
    use super::*;

    #[tokio::test]
    async fn streams_audio_in_fixed_size_chunks() {
        let synth = ScriptedSynthesizer::ok(vec![0u8; CHUNK_BYTES * 2 + 100]);
        let cancel = CancellationToken::new();
        let mut chunks = Vec::new();
        let mut completed = false;

        let outcome = synthesize_and_stream(
            &synth,
            "hello",
            "en-US",
            &cancel,
            |chunk| chunks.push(chunk.len()),
            || completed = true,
        )
        .await
        .expect("stream");

        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(chunks, vec![CHUNK_BYTES, CHUNK_BYTES, 100]);
        assert!(completed);
    }

    #[tokio::test]
    async fn cancellation_before_synthesis_skips_everything() {
        let synth = ScriptedSynthesizer::ok(vec![0u8; CHUNK_BYTES]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut chunk_count = 0;

        let outcome = synthesize_and_stream(
            &synth,
            "hello",
            "en-US",
            &cancel,
            |_| chunk_count += 1,
            || panic!("should not complete"),
        )
        .await
        .expect("stream");

        assert_eq!(outcome, StreamOutcome::Cancelled);
        assert_eq!(chunk_count, 0);
        assert_eq!(synth.call_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_mid_stream_stops_before_completion() {
        let synth = ScriptedSynthesizer::ok(vec![0u8; CHUNK_BYTES * 3]);
        let cancel = CancellationToken::new();
        let mut chunk_count = 0;

        let outcome = synthesize_and_stream(
            &synth,
            "hello",
            "en-US",
            &cancel,
            |_| {
                chunk_count += 1;
                if chunk_count == 1 {
                    cancel.cancel();
                }
            },
            || panic!("should not complete"),
        )
        .await
        .expect("stream");

        assert_eq!(outcome, StreamOutcome::Cancelled);
        assert_eq!(chunk_count, 1);
    }

    #[test]
    fn voice_selection_is_language_specific() {
        assert_eq!(voice_for_language("ko-KR"), "ko-KR-Standard-A");
        assert_eq!(voice_for_language("en-US"), "en-US-Neural2-F");
    }

    #[tokio::test]
    async fn synthesis_error_propagates() {
        let synth = ScriptedSynthesizer::err(TtsError::SynthesisFailed("quota exceeded".into()));
        let cancel = CancellationToken::new();
        let result = synthesize_and_stream(&synth, "hi", "en-US", &cancel, |_| {}, || {}).await;
        assert!(result.is_err());
    }
}
