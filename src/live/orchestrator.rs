//! Turn orchestrator (C7): the per-turn pipeline from a final transcript
//! through STT confidence gating, the LLM tool loop or plain streaming
//! call, structured-output enforcement, and TTS — with the generation
//! fence re-checked at every suspension point so a barge-in silently
//! drops every frame the cancelled turn would otherwise have emitted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use super::config::{LiveConfig, TargetLanguage};
use super::enforcer::{self, StructuredResponse};
use super::llm::{ContentBlock, LlmAdapter, Message, RequestOptions};
use super::metrics::{Metrics, TurnTiming};
use super::session::{CancelHandles, HistoryRole, SessionState};
use super::tools::{self, ToolError};
use super::tts::{self, TtsSynthesizer};
use super::wire::{Frame, server};

/// History entries attached to the conversation sent to the model for a
/// turn (distinct from the session's larger retention cap).
const TURN_HISTORY_LIMIT: usize = 10;

/// Everything the orchestrator needs besides the session/turn it's
/// currently running: the shared adapters and the config snapshot.
pub struct OrchestratorContext {
    pub llm: Arc<LlmAdapter>,
    pub tts: Arc<dyn TtsSynthesizer>,
    pub metrics: Arc<Metrics>,
    pub config: LiveConfig,
    pub frame_tx: tokio::sync::mpsc::UnboundedSender<Frame>,
}

fn is_image_required_query(query: &str) -> bool {
    let q = query.to_lowercase();
    ["this image", "in the image", "picture", "사진", "이미지", "첨부된"]
        .iter()
        .any(|k| q.contains(k))
}

/// Run one full turn. `generation` is the generation id this turn was
/// started under; every emission checks it against the session's
/// current generation before doing anything externally visible.
pub async fn run_turn(
    ctx: &OrchestratorContext,
    session: &Arc<SessionState>,
    turn_id: u64,
    generation: u64,
    cancel: CancelHandles,
    transcript: String,
    confidence: f32,
) {
    let started = Instant::now();
    // The STT worker doesn't report its own elapsed time back yet.
    let stt_ms = 0u64;
    let llm_started = Instant::now();

    if !emit_current(ctx, session, generation, server::TRANSCRIPT_FINAL, &json!({
        "text": transcript,
        "confidence": confidence,
    })) {
        return;
    }

    let language = session.target_language().await;
    let translator_mode = session.translator_mode();

    if confidence < ctx.config.stt_confidence_threshold {
        session.set_last_confidence(confidence).await;
        ctx.metrics.record_low_confidence_transcript();
        let text = canned_clarification(language);
        speak_canned_and_finish(ctx, session, turn_id, generation, &cancel, &text, &transcript, started, stt_ms).await;
        return;
    }

    if is_image_required_query(&transcript) && !session.has_uploaded_image().await {
        let text = canned_image_guard(language);
        speak_canned_and_finish(ctx, session, turn_id, generation, &cancel, &text, &transcript, started, stt_ms).await;
        return;
    }

    let history = session.recent_history(TURN_HISTORY_LIMIT).await;
    let mut messages: Vec<Message> = history
        .iter()
        .map(|h| match h.role {
            HistoryRole::User => Message::user(h.text.clone()),
            HistoryRole::Assistant => Message::assistant(vec![ContentBlock::Text { text: h.text.clone() }]),
        })
        .collect();

    let uploaded_image = session.take_uploaded_image().await;
    let user_message = match &uploaded_image {
        Some(image) => Message::user_with_image(
            transcript.clone(),
            image.media_type.clone(),
            base64_encode(&image.data),
        ),
        None => Message::user(transcript.clone()),
    };
    messages.push(user_message);

    let deadline = if uploaded_image.is_some() {
        Duration::from_millis(ctx.config.image_time_budget_ms)
    } else {
        Duration::from_millis(ctx.config.time_budget_ms)
    };

    let system_prompt = enforcer::structured_system_prompt(language, translator_mode);
    let options = RequestOptions {
        max_tokens: ctx.config.llm_max_tokens,
        temperature: ctx.config.llm_temperature,
    };
    let offered_tools = tools::available_tools_for_query(&transcript, translator_mode);

    let call = run_model_call(
        ctx,
        session,
        turn_id,
        &system_prompt,
        &messages,
        &options,
        &offered_tools,
        generation,
        &cancel,
    );
    let model_outcome = tokio::select! {
        outcome = tokio::time::timeout(deadline, call) => outcome,
        _ = cancel.llm_stream.cancelled() => return,
    };
    if !session.is_current(generation) {
        return;
    }

    let llm_ms = llm_started.elapsed().as_millis() as u64;

    let (raw_text, structured) = match model_outcome {
        Ok(Ok(text)) => {
            let structured = enforcer::enforce(
                &ctx.llm,
                &text,
                &system_prompt,
                &messages,
                language,
                ctx.config.strict_structured_mode,
            )
            .await;
            (text, structured)
        }
        Ok(Err(_)) | Err(_) => {
            // Transport failure or turn-budget timeout: produce a quick
            // summary and proceed directly to TTS, per §4.7 step 7.
            (String::new(), enforcer::canned_fallback(language))
        }
    };
    let _ = raw_text;

    finish_turn(ctx, session, turn_id, generation, &cancel, &transcript, &structured, language, started, stt_ms, llm_ms)
        .await;
}

/// Run either the tool loop or a plain streaming call, per whether any
/// tool is offered for this query. Returns the final raw model text.
#[allow(clippy::too_many_arguments)]
async fn run_model_call(
    ctx: &OrchestratorContext,
    session: &Arc<SessionState>,
    turn_id: u64,
    system_prompt: &str,
    messages: &[Message],
    options: &RequestOptions,
    offered_tools: &[super::llm::ToolDefinition],
    generation: u64,
    cancel: &CancelHandles,
) -> Result<String, super::llm::LlmError> {
    if offered_tools.is_empty() {
        let result = ctx
            .llm
            .stream_text(messages, options, |delta| {
                emit_current(ctx, session, generation, server::LLM_DELTA, &json!({
                    "text": delta,
                    "turn_id": turn_id,
                    "final": false,
                }));
            })
            .await?;
        emit_current(ctx, session, generation, server::LLM_DELTA, &json!({
            "text": "",
            "turn_id": turn_id,
            "final": true,
        }));
        return Ok(result.text);
    }

    let mut loop_messages = messages.to_vec();
    let mut final_text = String::new();
    let max_iters = ctx.config.tool_max_iters.max(1);
    let tool_timeout = Duration::from_millis(ctx.config.tool_timeout_ms);

    for _ in 0..max_iters {
        if cancel.llm_stream.is_cancelled() || !session.is_current(generation) {
            break;
        }
        let response = ctx.llm.create(&loop_messages, options, offered_tools).await?;
        final_text = response.text.clone();

        let tool_uses: Vec<&ContentBlock> = response
            .content
            .iter()
            .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
            .collect();
        if tool_uses.is_empty() {
            break;
        }

        loop_messages.push(Message::assistant(response.content.clone()));
        for block in tool_uses {
            if let ContentBlock::ToolUse { call_id, name, arguments } = block {
                ctx.metrics.record_tool_call();
                let outcome =
                    tokio::time::timeout(tool_timeout, async { tools::execute_tool(name, arguments) }).await;
                let (content, is_error) = match outcome {
                    Ok(Ok(value)) => (value.to_string(), false),
                    Ok(Err(err)) => {
                        ctx.metrics.record_tool_failure();
                        (tool_error_json(&err), true)
                    }
                    Err(_) => {
                        ctx.metrics.record_tool_failure();
                        (tool_error_json(&ToolError::ExecutionFailed("timed out".into())), true)
                    }
                };
                loop_messages.push(Message::tool_result(call_id.clone(), content, is_error));
            }
        }
    }

    let _ = system_prompt;
    emit_current(ctx, session, generation, server::LLM_DELTA, &json!({
        "text": final_text,
        "turn_id": turn_id,
        "final": true,
    }));
    Ok(final_text)
}

fn tool_error_json(err: &ToolError) -> String {
    json!({ "error": err.to_string() }).to_string()
}

async fn speak_canned_and_finish(
    ctx: &OrchestratorContext,
    session: &Arc<SessionState>,
    turn_id: u64,
    generation: u64,
    cancel: &CancelHandles,
    speakable_text: &str,
    user_text: &str,
    started: Instant,
    stt_ms: u64,
) {
    if !emit_current(ctx, session, generation, server::LLM_DELTA, &json!({
        "text": speakable_text,
        "turn_id": turn_id,
        "final": true,
    })) {
        return;
    }
    let language = session.target_language().await;
    let structured = enforcer::canned_fallback(language);
    finish_turn(ctx, session, turn_id, generation, cancel, user_text, &structured, language, started, stt_ms, 0).await;
}

#[allow(clippy::too_many_arguments)]
async fn finish_turn(
    ctx: &OrchestratorContext,
    session: &Arc<SessionState>,
    turn_id: u64,
    generation: u64,
    cancel: &CancelHandles,
    user_text: &str,
    structured: &StructuredResponse,
    language: TargetLanguage,
    started: Instant,
    stt_ms: u64,
    llm_ms: u64,
) {
    let speakable = structured.to_speakable_text(language);
    let tts_started = Instant::now();
    session.set_tts_playing(true);

    let language_code = match language {
        TargetLanguage::En => "en-US",
        TargetLanguage::Ko => "ko-KR",
    };

    let ctx_frame_tx = ctx.frame_tx.clone();
    let session_for_tts = session.clone();
    let generation_for_tts = generation;
    let outcome = tts::synthesize_and_stream(
        ctx.tts.as_ref(),
        &speakable,
        language_code,
        &cancel.tts,
        |chunk| {
            if session_for_tts.is_current(generation_for_tts) {
                let frame = Frame::new(server::AUDIO_CHUNK, chunk.to_vec());
                let _ = ctx_frame_tx.send(frame);
            }
        },
        || {
            if session.is_current(generation_for_tts) {
                let frame = Frame::new(server::AUDIO_COMPLETE, Vec::new());
                let _ = ctx.frame_tx.send(frame);
            }
        },
    )
    .await;
    session.set_tts_playing(false);
    let tts_ms = tts_started.elapsed().as_millis() as u64;

    if !matches!(outcome, Ok(tts::StreamOutcome::Completed)) || !session.is_current(generation) {
        return;
    }

    emit_current(ctx, session, generation, server::NOTES, &json!({
        "text": structured.to_pretty_json(),
    }));

    session.push_history(HistoryRole::User, user_text.to_string()).await;
    session.push_history(HistoryRole::Assistant, structured.answer.clone()).await;

    let e2e_ms = started.elapsed().as_millis() as u64;
    ctx.metrics.record_turn(TurnTiming { stt_ms, llm_ms, tts_ms, e2e_ms });
    let _ = turn_id;
}

/// Emit a frame only if the session is still on the generation this
/// turn started under. Returns whether the frame was sent.
fn emit_current(
    ctx: &OrchestratorContext,
    session: &Arc<SessionState>,
    generation: u64,
    frame_type: u8,
    payload: &serde_json::Value,
) -> bool {
    if !session.is_current(generation) {
        return false;
    }
    match Frame::json(frame_type, payload) {
        Ok(frame) => ctx.frame_tx.send(frame).is_ok(),
        Err(_) => false,
    }
}

fn canned_clarification(language: TargetLanguage) -> String {
    match language {
        TargetLanguage::En => "Sorry, I didn't quite catch that. Could you say it again?".to_string(),
        TargetLanguage::Ko => "죄송해요, 잘 듣지 못했어요. 다시 한 번 말씀해 주시겠어요?".to_string(),
    }
}

fn canned_image_guard(language: TargetLanguage) -> String {
    match language {
        TargetLanguage::En => {
            "It looks like you're asking about an image, but I don't see one uploaded yet. Could you upload it?"
                .to_string()
        }
        TargetLanguage::Ko => {
            "이미지에 대해 물어보신 것 같은데 아직 업로드된 이미지가 없어요. 업로드해 주시겠어요?".to_string()
        }
    }
}

fn base64_encode(data: &bytes::Bytes) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::config::TargetLanguage;
    use crate::live::llm::test_support::ScriptedProvider;
    use crate::live::llm::{FinishReason, LlmEvent};
    use crate::live::metrics::Metrics;
    use crate::live::tts::test_support::ScriptedSynthesizer;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn new_context(
        primary_events: Vec<LlmEvent>,
        tts_audio: Vec<u8>,
    ) -> (OrchestratorContext, mpsc::UnboundedReceiver<Frame>) {
        let primary = Arc::new(ScriptedProvider::ok("primary", primary_events));
        let fallback = Arc::new(ScriptedProvider::ok("fallback", vec![]));
        let llm = Arc::new(LlmAdapter::new(primary, fallback, Duration::from_secs(5)));
        let tts = Arc::new(ScriptedSynthesizer::ok(tts_audio));
        let metrics = Arc::new(Metrics::new(100));
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        (
            OrchestratorContext {
                llm,
                tts,
                metrics,
                config: LiveConfig::default(),
                frame_tx,
            },
            frame_rx,
        )
    }

    fn new_session() -> Arc<SessionState> {
        SessionState::new("sess-1", TargetLanguage::En, false, 16).0
    }

    async fn drain_frames(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn low_confidence_turn_skips_llm_and_speaks_clarification() {
        let (ctx, mut rx) = new_context(vec![], vec![0u8; 10]);
        let session = new_session();
        let (turn_id, generation, cancel) = session.begin_turn().await;

        run_turn(&ctx, &session, turn_id, generation, cancel, "mumble".into(), 0.2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frames = drain_frames(&mut rx).await;
        let types: Vec<u8> = frames.iter().map(|f| f.frame_type).collect();
        assert!(types.contains(&server::TRANSCRIPT_FINAL));
        assert!(types.contains(&server::LLM_DELTA));
        assert!(types.contains(&server::AUDIO_COMPLETE));
        assert!(types.contains(&server::NOTES));
    }

    #[tokio::test]
    async fn image_required_query_without_upload_skips_llm() {
        let (ctx, mut rx) = new_context(vec![], vec![0u8; 10]);
        let session = new_session();
        let (turn_id, generation, cancel) = session.begin_turn().await;

        run_turn(&ctx, &session, turn_id, generation, cancel, "what is in this image".into(), 0.95).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frames = drain_frames(&mut rx).await;
        let types: Vec<u8> = frames.iter().map(|f| f.frame_type).collect();
        assert!(types.contains(&server::NOTES));
    }

    #[tokio::test]
    async fn happy_path_emits_final_delta_audio_and_notes() {
        let valid_json = r#"{"answer":"2+3=5","steps":["add"],"examples":["ex"],"common_mistakes":[],"next_exercises":[]}"#;
        let (ctx, mut rx) = new_context(
            vec![
                LlmEvent::TextDelta { text: valid_json.to_string() },
                LlmEvent::StreamEnd { finish_reason: FinishReason::Stop },
            ],
            vec![0u8; 10],
        );
        let session = new_session();
        let (turn_id, generation, cancel) = session.begin_turn().await;

        run_turn(&ctx, &session, turn_id, generation, cancel, "hello there".into(), 0.95).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frames = drain_frames(&mut rx).await;
        let types: Vec<u8> = frames.iter().map(|f| f.frame_type).collect();
        assert_eq!(types[0], server::TRANSCRIPT_FINAL);
        assert!(types.contains(&server::LLM_DELTA));
        assert!(types.contains(&server::AUDIO_COMPLETE));
        assert_eq!(*types.last().unwrap(), server::NOTES);
    }

    #[tokio::test]
    async fn cancellation_before_turn_starts_suppresses_all_frames() {
        let (ctx, mut rx) = new_context(vec![], vec![0u8; 10]);
        let session = new_session();
        let (turn_id, generation, cancel) = session.begin_turn().await;
        session.increment_generation();

        run_turn(&ctx, &session, turn_id, generation, cancel, "hello".into(), 0.95).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let frames = drain_frames(&mut rx).await;
        assert!(frames.is_empty());
    }

    #[tokio::test]
    async fn tool_offering_query_runs_tool_loop() {
        let valid_json = r#"{"answer":"5","steps":[],"examples":[],"common_mistakes":[],"next_exercises":[]}"#;
        let (ctx, mut rx) = new_context(
            vec![
                LlmEvent::TextDelta { text: valid_json.to_string() },
                LlmEvent::StreamEnd { finish_reason: FinishReason::Stop },
            ],
            vec![0u8; 10],
        );
        let session = new_session();
        let (turn_id, generation, cancel) = session.begin_turn().await;

        run_turn(&ctx, &session, turn_id, generation, cancel, "what is 2 + 3".into(), 0.95).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frames = drain_frames(&mut rx).await;
        assert!(frames.iter().any(|f| f.frame_type == server::NOTES));
        assert_eq!(ctx.metrics.report().tool_calls_total, 0); // no tool_use block in scripted response
    }

    #[tokio::test]
    async fn uploaded_image_attaches_and_is_consumed() {
        let (ctx, mut rx) = new_context(
            vec![
                LlmEvent::TextDelta { text: "plain text answer".to_string() },
                LlmEvent::StreamEnd { finish_reason: FinishReason::Stop },
            ],
            vec![0u8; 10],
        );
        let session = new_session();
        session
            .set_uploaded_image(crate::live::session::UploadedImage {
                media_type: "image/jpeg".into(),
                data: Bytes::from_static(b"\xff\xd8"),
            })
            .await;
        let (turn_id, generation, cancel) = session.begin_turn().await;

        run_turn(&ctx, &session, turn_id, generation, cancel, "what is in this image".into(), 0.95).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!session.has_uploaded_image().await);
        let frames = drain_frames(&mut rx).await;
        assert!(frames.iter().any(|f| f.frame_type == server::NOTES));
    }
}
