//! Endpoint (C10): the axum HTTP/WebSocket surface that ties every other
//! `live` component together. One reader task per connection, grounded on
//! the `LlmServer`/`gateway_health` pattern this crate already uses for
//! its other HTTP surfaces (`src/llm/server.rs`, `src/channels/gateway.rs`).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::config::{LiveConfig, TargetLanguage};
use super::enforcer;
use super::llm::{LlmAdapter, Message as LlmMessage, RequestOptions};
use super::metrics::Metrics;
use super::orchestrator::{self, OrchestratorContext};
use super::session::{EnqueueOutcome, SessionState, UploadedImage};
use super::stt::{RecognizerConfig, SttAdapter, SttEvent, StreamingRecognizer};
use super::tts::TtsSynthesizer;
use super::wire::{Frame, FrameError, client, server};

/// Off-turn summarization prompt, mirroring the dedicated `REQUEST_NOTES`
/// prompt the original endpoint sends — no tools, no audio.
const NOTES_PROMPT: &str = "Summarize our tutoring session so far. Return JSON with answer, \
steps, examples, common_mistakes, next_exercises. Do NOT speak these aloud; just return text \
notes.";

/// The shared, process-wide adapters the endpoint hands to every session:
/// the vendor-agnostic STT/LLM/TTS adapters, metrics, and configuration.
pub struct LiveServices {
    pub recognizer: Arc<dyn StreamingRecognizer>,
    pub llm: Arc<LlmAdapter>,
    pub tts: Arc<dyn TtsSynthesizer>,
    pub metrics: Arc<Metrics>,
    pub config: LiveConfig,
}

/// The running voice-tutor HTTP/WebSocket server.
pub struct LiveServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl LiveServer {
    /// Bind and start serving. Exposes `GET /ws` (the protocol upgrade),
    /// `GET /health` (liveness), and `GET /api/metrics` (a JSON dump of
    /// [`Metrics::report`]) on the same listener.
    pub async fn start(services: Arc<LiveServices>, bind_addr: &str) -> crate::error::Result<Self> {
        let app = Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health))
            .route("/api/metrics", get(metrics_json))
            .with_state(services);

        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| crate::error::SpeechError::Live(format!("endpoint bind failed: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| crate::error::SpeechError::Live(format!("failed to read local addr: {e}")))?;

        tracing::info!("live voice-tutor endpoint listening on ws://{addr}/ws");

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("live endpoint server error: {e}");
            }
        });

        Ok(Self { addr, handle })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Abort the background server task.
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for LiveServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics_json(State(services): State<Arc<LiveServices>>) -> impl IntoResponse {
    Json(services.metrics.report())
}

async fn ws_handler(State(services): State<Arc<LiveServices>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, services))
}

#[derive(Debug, Deserialize)]
struct InitPayload {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    target_language: Option<TargetLanguage>,
    #[serde(default)]
    translator_mode: bool,
}

#[derive(Debug, Deserialize)]
struct ConfigUpdatePayload {
    #[serde(default)]
    target_language: Option<TargetLanguage>,
    #[serde(default)]
    translator_mode: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ImageUploadPayload {
    image_data: String,
}

fn stt_language_code(language: TargetLanguage) -> &'static str {
    match language {
        TargetLanguage::En => "en-US",
        TargetLanguage::Ko => "ko-KR",
    }
}

fn send_frame(tx: &mpsc::UnboundedSender<Frame>, frame_type: u8, payload: &serde_json::Value) {
    match Frame::json(frame_type, payload) {
        Ok(frame) => {
            let _ = tx.send(frame);
        }
        Err(e) => tracing::error!(%e, "failed to serialize outgoing frame"),
    }
}

fn send_error(tx: &mpsc::UnboundedSender<Frame>, code: u32, message: impl Into<String>) {
    send_frame(tx, server::ERROR, &serde_json::json!({ "message": message.into(), "code": code }));
}

/// Decode an `IMAGE_UPLOAD` payload's `image_data` field: a
/// `data:<mime>;base64,<data>` URL, or raw base64 defaulting to
/// `image/jpeg` when no recognized prefix is present, per the resolved
/// open question on the media-type fallback.
fn decode_image_data(image_data: &str) -> Result<(String, Bytes), String> {
    let (media_type, raw) = match image_data.strip_prefix("data:").and_then(|rest| rest.split_once(";base64,")) {
        Some((mime, data)) => (mime.to_string(), data),
        None => ("image/jpeg".to_string(), image_data),
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(|e| format!("invalid base64 image data: {e}"))?;
    Ok((media_type, Bytes::from(bytes)))
}

/// Read the next binary frame off the socket, skipping ping/pong/text and
/// returning `None` once the connection closes or errors.
async fn recv_frame(
    stream: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<Result<Frame, FrameError>> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => return Some(Frame::decode(&data)),
            Some(Ok(Message::Close(_))) => return None,
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

async fn handle_connection(socket: WebSocket, services: Arc<LiveServices>) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Frame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if ws_sink.send(Message::Binary(frame.encode().into())).await.is_err() {
                break;
            }
        }
    });

    let Some(Ok(init_frame)) = recv_frame(&mut ws_stream).await else {
        send_error(&frame_tx, 400, "expected an INIT frame before any other message");
        drop(frame_tx);
        let _ = writer.await;
        return;
    };
    if init_frame.frame_type != client::INIT {
        send_error(&frame_tx, 400, "expected INIT as the first message");
        drop(frame_tx);
        let _ = writer.await;
        return;
    }
    let init: InitPayload = match init_frame.json_payload() {
        Ok(p) => p,
        Err(e) => {
            send_error(&frame_tx, 400, format!("invalid INIT payload: {e}"));
            drop(frame_tx);
            let _ = writer.await;
            return;
        }
    };

    let session_id = init.session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let target_language = init.target_language.unwrap_or(services.config.target_language);
    let (session, mut audio_rx) = SessionState::new(
        session_id.clone(),
        target_language,
        init.translator_mode,
        services.config.audio_queue_capacity,
    );

    let (stt_events_tx, mut stt_events_rx) = mpsc::unbounded_channel::<SttEvent>();
    let stt = Arc::new(SttAdapter::new(
        services.recognizer.clone(),
        RecognizerConfig {
            language_code: stt_language_code(target_language).to_string(),
            sample_rate_hz: services.config.stt_sample_rate_hz,
        },
        stt_events_tx,
        Duration::from_millis(services.config.stt_stream_close_wait_ms),
    ));

    // Feeds the bounded audio queue into the STT adapter. Kept separate
    // from the recognition worker itself, which `SttAdapter` spawns and
    // owns per utterance.
    let feeder = {
        let stt = stt.clone();
        let session = session.clone();
        tokio::spawn(async move {
            while let Some(frame) = audio_rx.recv().await {
                stt.push_audio_frame(frame).await;
                session.mark_audio_received().await;
            }
        })
    };

    // Silence timer (§4.3.4): a safety net that rotates the STT stream
    // even when the recognizer never reports `is_final`, bounding its
    // internal state growth. Runs independently of the turn-budget check
    // in the frame-dispatch loop below.
    let silence_timer = {
        let stt = stt.clone();
        let session = session.clone();
        let silence_timeout = Duration::from_millis(services.config.turn_silence_ms);
        let poll_interval = (silence_timeout / 4).max(Duration::from_millis(50));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval).await;
                if !stt.is_active().await {
                    continue;
                }
                let Some(last_audio) = session.last_audio_time().await else {
                    continue;
                };
                if last_audio.elapsed() >= silence_timeout {
                    stt.close_and_restart_stream().await;
                }
            }
        })
    };

    send_frame(&frame_tx, server::CONNECTED, &serde_json::json!({ "session_id": session_id }));

    let ctx = Arc::new(OrchestratorContext {
        llm: services.llm.clone(),
        tts: services.tts.clone(),
        metrics: services.metrics.clone(),
        config: services.config.clone(),
        frame_tx: frame_tx.clone(),
    });

    // Forwards STT events to the client; a final transcript starts a new
    // turn and hands it off to the orchestrator on its own task.
    let events_task = {
        let frame_tx = frame_tx.clone();
        let session = session.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            while let Some(event) = stt_events_rx.recv().await {
                match event {
                    SttEvent::Interim { text } => {
                        if !text.trim().is_empty() {
                            send_frame(&frame_tx, server::TRANSCRIPT_INTERIM, &serde_json::json!({ "text": text }));
                        }
                    }
                    SttEvent::Final { text, confidence } => {
                        if text.trim().is_empty() {
                            continue;
                        }
                        session.set_last_confidence(confidence).await;
                        let (turn_id, generation, cancel) = session.begin_turn().await;
                        let ctx = ctx.clone();
                        let session = session.clone();
                        tokio::spawn(async move {
                            orchestrator::run_turn(&ctx, &session, turn_id, generation, cancel, text, confidence).await;
                        });
                    }
                }
            }
        })
    };

    let mut last_drop_log: Option<Instant> = None;

    loop {
        let Some(decoded) = recv_frame(&mut ws_stream).await else {
            break;
        };
        let frame = match decoded {
            Ok(frame) => frame,
            Err(e) => {
                send_error(&frame_tx, 400, format!("malformed frame: {e}"));
                break;
            }
        };

        match frame.frame_type {
            client::AUDIO_FRAME => {
                session.ensure_turn_started().await;
                let elapsed = session.turn_elapsed().await.unwrap_or_default();
                let prospective_bytes = session.turn_audio_bytes() + frame.payload.len() as u64;
                if prospective_bytes > services.config.max_audio_bytes
                    || elapsed.as_secs() >= services.config.turn_max_seconds
                {
                    send_error(&frame_tx, 413, "turn exceeded its audio budget");
                    session.reset_turn_audio().await;
                    stt.close_and_restart_stream().await;
                    continue;
                }
                if session.enqueue_audio(frame.payload) == EnqueueOutcome::Dropped {
                    services.metrics.record_dropped_audio_frame();
                    let now = Instant::now();
                    let should_log = last_drop_log.is_none_or(|t| now.duration_since(t) >= Duration::from_secs(1));
                    if should_log {
                        tracing::warn!(session_id = %session.session_id, "dropping audio frame under backpressure");
                        last_drop_log = Some(now);
                    }
                }
            }
            client::SPEECH_START | client::BARGE_IN => {
                session.increment_generation();
                session.cancel_active().await;
                session.reset_turn_audio().await;
            }
            client::SPEECH_END => {
                tracing::debug!(session_id = %session.session_id, "speech_end received; endpointing is left to the recognizer");
            }
            client::CONFIG_UPDATE => {
                handle_config_update(&frame, &session, &stt, &frame_tx).await;
            }
            client::IMAGE_UPLOAD => {
                handle_image_upload(&frame, &session, &frame_tx).await;
            }
            client::REQUEST_NOTES => {
                let ctx = ctx.clone();
                let session = session.clone();
                tokio::spawn(async move { run_off_turn_notes(ctx, session).await });
            }
            other => {
                send_error(&frame_tx, 400, format!("unknown frame type 0x{other:02x}"));
            }
        }
    }

    session.cancel_active().await;
    stt.close().await;
    events_task.abort();
    feeder.abort();
    silence_timer.abort();
    drop(frame_tx);
    let _ = writer.await;
}

async fn handle_config_update(
    frame: &Frame,
    session: &Arc<SessionState>,
    stt: &Arc<SttAdapter>,
    frame_tx: &mpsc::UnboundedSender<Frame>,
) {
    let payload: ConfigUpdatePayload = match frame.json_payload() {
        Ok(p) => p,
        Err(e) => {
            send_error(frame_tx, 400, format!("invalid CONFIG_UPDATE payload: {e}"));
            return;
        }
    };

    let mut language_changed = false;
    if let Some(lang) = payload.target_language {
        if lang != session.target_language().await {
            language_changed = true;
        }
        session.set_target_language(lang).await;
    }
    if let Some(mode) = payload.translator_mode {
        session.set_translator_mode(mode);
    }

    if language_changed {
        let lang = session.target_language().await;
        stt.set_language(stt_language_code(lang)).await;
        stt.close_and_restart_stream().await;
    }

    send_frame(frame_tx, server::CONFIG_UPDATED, &serde_json::json!({ "status": "ok" }));
}

async fn handle_image_upload(frame: &Frame, session: &Arc<SessionState>, frame_tx: &mpsc::UnboundedSender<Frame>) {
    let payload: ImageUploadPayload = match frame.json_payload() {
        Ok(p) => p,
        Err(e) => {
            send_error(frame_tx, 400, format!("invalid IMAGE_UPLOAD payload: {e}"));
            return;
        }
    };

    match decode_image_data(&payload.image_data) {
        Ok((media_type, data)) => {
            session.set_uploaded_image(UploadedImage { media_type, data }).await;
            send_frame(frame_tx, server::IMAGE_RECEIVED, &serde_json::json!({ "status": "ready" }));
        }
        Err(e) => send_error(frame_tx, 400, e),
    }
}

/// Run an off-turn notes summarization: no tools, no TTS, just a `NOTES`
/// frame built the same way a turn's own structured response is.
async fn run_off_turn_notes(ctx: Arc<OrchestratorContext>, session: Arc<SessionState>) {
    let language = session.target_language().await;
    let translator_mode = session.translator_mode();
    let system_prompt = enforcer::structured_system_prompt(language, translator_mode);
    let messages = vec![LlmMessage::user(NOTES_PROMPT)];
    let options = RequestOptions {
        max_tokens: ctx.config.llm_max_tokens,
        temperature: ctx.config.llm_temperature,
    };

    let structured = match ctx.llm.create(&messages, &options, &[]).await {
        Ok(result) => {
            enforcer::enforce(
                &ctx.llm,
                &result.text,
                &system_prompt,
                &messages,
                language,
                ctx.config.strict_structured_mode,
            )
            .await
        }
        Err(e) => {
            tracing::warn!(error = %e, "notes generation failed, falling back to canned response");
            enforcer::canned_fallback(language)
        }
    };

    send_frame(&ctx.frame_tx, server::NOTES, &serde_json::json!({ "text": structured.to_pretty_json() }));
}
