//! Per-connection session state: the generation fence, the bounded audio
//! queue, conversation history, and the cancel handles a turn needs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::config::TargetLanguage;

/// Maximum conversation turns retained in history.
const HISTORY_CAP: usize = 20;

/// Outcome of a non-blocking audio enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    Dropped,
}

/// One turn of conversation history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRole {
    User,
    Assistant,
}

/// An uploaded image attached to the session (not yet consumed by a turn).
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub media_type: String,
    pub data: Bytes,
}

/// The three cancellation scopes a turn can fire: the orchestrator task
/// itself, the TTS streamer, and (best-effort) the in-flight LLM call.
#[derive(Clone)]
pub struct CancelHandles {
    pub orchestrator: CancellationToken,
    pub tts: CancellationToken,
    pub llm_stream: CancellationToken,
}

impl CancelHandles {
    fn fresh() -> Self {
        Self {
            orchestrator: CancellationToken::new(),
            tts: CancellationToken::new(),
            llm_stream: CancellationToken::new(),
        }
    }

    fn cancel_all(&self) {
        self.orchestrator.cancel();
        self.tts.cancel();
        self.llm_stream.cancel();
    }
}

/// Per-connection state shared across the endpoint loop, the orchestrator
/// task, and the STT worker.
///
/// The STT adapter's own `(active_queue, runner_handle)` pair lives
/// separately in [`super::stt::SttAdapter`], guarded by that adapter's
/// own lock. `SessionState` owns everything else: the generation fence,
/// history, the bounded audio SPSC channel, and cancel handles.
pub struct SessionState {
    pub session_id: String,
    target_language: Mutex<TargetLanguage>,
    translator_mode: AtomicBool,
    history: Mutex<VecDeque<HistoryEntry>>,
    uploaded_image: Mutex<Option<UploadedImage>>,
    audio_tx: mpsc::Sender<Bytes>,
    dropped_frames: AtomicU64,
    current_turn_id: AtomicU64,
    generation_id: AtomicU64,
    cancel: Mutex<CancelHandles>,
    turn_started_at: Mutex<Option<Instant>>,
    turn_audio_bytes: AtomicU64,
    last_audio_time: Mutex<Option<Instant>>,
    last_transcript_confidence: Mutex<Option<f32>>,
    is_tts_playing: AtomicBool,
}

impl SessionState {
    /// Create a new session, returning the state handle plus the receiving
    /// end of its bounded audio queue (to be handed to the STT adapter).
    pub fn new(
        session_id: impl Into<String>,
        target_language: TargetLanguage,
        translator_mode: bool,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (audio_tx, audio_rx) = mpsc::channel(queue_capacity.max(1));
        let state = Arc::new(Self {
            session_id: session_id.into(),
            target_language: Mutex::new(target_language),
            translator_mode: AtomicBool::new(translator_mode),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAP)),
            uploaded_image: Mutex::new(None),
            audio_tx,
            dropped_frames: AtomicU64::new(0),
            current_turn_id: AtomicU64::new(0),
            generation_id: AtomicU64::new(0),
            cancel: Mutex::new(CancelHandles::fresh()),
            turn_started_at: Mutex::new(None),
            turn_audio_bytes: AtomicU64::new(0),
            last_audio_time: Mutex::new(None),
            last_transcript_confidence: Mutex::new(None),
            is_tts_playing: AtomicBool::new(false),
        });
        (state, audio_rx)
    }

    /// Current generation id. Only `increment_generation` advances it.
    pub fn generation(&self) -> u64 {
        self.generation_id.load(Ordering::SeqCst)
    }

    /// Bump the generation fence. Called by the endpoint loop on
    /// `SPEECH_START`, `BARGE_IN`, or the start of a new turn.
    pub fn increment_generation(&self) -> u64 {
        self.generation_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Whether a value computed under generation `g` is still current.
    /// Callers must check this before any externally visible side effect.
    pub fn is_current(&self, g: u64) -> bool {
        self.generation() == g
    }

    /// Begin a new turn: allocate a turn id, reset per-turn counters, and
    /// return fresh cancel handles for it.
    pub async fn begin_turn(&self) -> (u64, u64, CancelHandles) {
        let turn_id = self.current_turn_id.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = self.generation();
        self.turn_audio_bytes.store(0, Ordering::SeqCst);
        *self.turn_started_at.lock().await = Some(Instant::now());
        let handles = CancelHandles::fresh();
        *self.cancel.lock().await = handles.clone();
        (turn_id, generation, handles)
    }

    /// Cancel all in-flight turn-scope work (orchestrator, TTS, LLM
    /// stream), leaving the STT adapter untouched.
    pub async fn cancel_active(&self) {
        self.cancel.lock().await.cancel_all();
    }

    /// Current turn-scope cancel handles (used by newly spawned orchestrator
    /// work to race against cancellation).
    pub async fn cancel_handles(&self) -> CancelHandles {
        self.cancel.lock().await.clone()
    }

    /// Non-blocking enqueue of one audio frame. Never blocks the
    /// caller; on a saturated queue the frame is dropped and the drop
    /// counter bumped.
    pub fn enqueue_audio(&self, frame: Bytes) -> EnqueueOutcome {
        let len = frame.len() as u64;
        match self.audio_tx.try_send(frame) {
            Ok(()) => {
                self.turn_audio_bytes.fetch_add(len, Ordering::SeqCst);
                EnqueueOutcome::Accepted
            }
            Err(_) => {
                self.dropped_frames.fetch_add(1, Ordering::SeqCst);
                EnqueueOutcome::Dropped
            }
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::SeqCst)
    }

    pub fn turn_audio_bytes(&self) -> u64 {
        self.turn_audio_bytes.load(Ordering::SeqCst)
    }

    pub async fn mark_audio_received(&self) {
        *self.last_audio_time.lock().await = Some(Instant::now());
    }

    pub async fn last_audio_time(&self) -> Option<Instant> {
        *self.last_audio_time.lock().await
    }

    /// Mark the start of turn-audio accounting if it hasn't already been
    /// marked for the current utterance. `begin_turn` re-marks this when a
    /// turn finalizes, so this only matters for the very first utterance
    /// after session creation or after an over-budget reset.
    pub async fn ensure_turn_started(&self) {
        let mut started = self.turn_started_at.lock().await;
        if started.is_none() {
            *started = Some(Instant::now());
        }
    }

    /// Elapsed time since turn-audio accounting started, if any.
    pub async fn turn_elapsed(&self) -> Option<std::time::Duration> {
        self.turn_started_at.lock().await.map(|t| t.elapsed())
    }

    /// Reset per-turn audio accounting (bytes + start time) without
    /// touching the turn/generation counters. Used when an over-budget
    /// turn is discarded: the generation stays intact per §7.
    pub async fn reset_turn_audio(&self) {
        self.turn_audio_bytes.store(0, Ordering::SeqCst);
        *self.turn_started_at.lock().await = Some(Instant::now());
    }

    pub async fn target_language(&self) -> TargetLanguage {
        *self.target_language.lock().await
    }

    pub async fn set_target_language(&self, lang: TargetLanguage) {
        *self.target_language.lock().await = lang;
    }

    pub fn translator_mode(&self) -> bool {
        self.translator_mode.load(Ordering::SeqCst)
    }

    pub fn set_translator_mode(&self, enabled: bool) {
        self.translator_mode.store(enabled, Ordering::SeqCst);
    }

    pub async fn set_last_confidence(&self, confidence: f32) {
        *self.last_transcript_confidence.lock().await = Some(confidence);
    }

    pub async fn last_confidence(&self) -> Option<f32> {
        *self.last_transcript_confidence.lock().await
    }

    pub async fn set_uploaded_image(&self, image: UploadedImage) {
        *self.uploaded_image.lock().await = Some(image);
    }

    pub async fn take_uploaded_image(&self) -> Option<UploadedImage> {
        self.uploaded_image.lock().await.take()
    }

    pub async fn has_uploaded_image(&self) -> bool {
        self.uploaded_image.lock().await.is_some()
    }

    pub fn set_tts_playing(&self, playing: bool) {
        self.is_tts_playing.store(playing, Ordering::SeqCst);
    }

    pub fn is_tts_playing(&self) -> bool {
        self.is_tts_playing.load(Ordering::SeqCst)
    }

    /// Append a user/assistant turn to history, capped at 20 entries.
    pub async fn push_history(&self, role: HistoryRole, text: impl Into<String>) {
        let mut history = self.history.lock().await;
        history.push_back(HistoryEntry {
            role,
            text: text.into(),
        });
        while history.len() > HISTORY_CAP {
            history.pop_front();
        }
    }

    /// Snapshot the last `limit` history entries (oldest first).
    pub async fn recent_history(&self, limit: usize) -> Vec<HistoryEntry> {
        let history = self.history.lock().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session() -> Arc<SessionState> {
        SessionState::new("sess-1", TargetLanguage::En, false, 4).0
    }

    #[tokio::test]
    async fn enqueue_audio_accepts_until_capacity_then_drops() {
        let (session, mut rx) = SessionState::new("sess-1", TargetLanguage::En, false, 2);
        assert_eq!(
            session.enqueue_audio(Bytes::from_static(b"a")),
            EnqueueOutcome::Accepted
        );
        assert_eq!(
            session.enqueue_audio(Bytes::from_static(b"b")),
            EnqueueOutcome::Accepted
        );
        assert_eq!(
            session.enqueue_audio(Bytes::from_static(b"c")),
            EnqueueOutcome::Dropped
        );
        assert_eq!(session.dropped_frames(), 1);
        // drain so the receiver isn't dropped before the sender side is done
        let _ = rx.try_recv();
        let _ = rx.try_recv();
    }

    #[test]
    fn generation_increments_are_strictly_monotonic() {
        let session = new_session();
        assert_eq!(session.generation(), 0);
        assert_eq!(session.increment_generation(), 1);
        assert_eq!(session.increment_generation(), 2);
        assert_eq!(session.generation(), 2);
    }

    #[test]
    fn is_current_reflects_generation_fence() {
        let session = new_session();
        let g0 = session.generation();
        assert!(session.is_current(g0));
        session.increment_generation();
        assert!(!session.is_current(g0));
    }

    #[tokio::test]
    async fn begin_turn_allocates_monotonic_turn_ids() {
        let session = new_session();
        let (t1, _, _) = session.begin_turn().await;
        let (t2, _, _) = session.begin_turn().await;
        assert_eq!(t2, t1 + 1);
    }

    #[tokio::test]
    async fn cancel_active_cancels_all_turn_scope_handles() {
        let session = new_session();
        let (_, _, handles) = session.begin_turn().await;
        assert!(!handles.orchestrator.is_cancelled());
        session.cancel_active().await;
        assert!(handles.orchestrator.is_cancelled());
        assert!(handles.tts.is_cancelled());
        assert!(handles.llm_stream.is_cancelled());
    }

    #[tokio::test]
    async fn history_is_capped_at_twenty_entries() {
        let session = new_session();
        for i in 0..25 {
            session
                .push_history(HistoryRole::User, format!("msg {i}"))
                .await;
        }
        let recent = session.recent_history(100).await;
        assert_eq!(recent.len(), 20);
        assert_eq!(recent[0].text, "msg 5");
        assert_eq!(recent[19].text, "msg 24");
    }

    #[tokio::test]
    async fn recent_history_respects_limit() {
        let session = new_session();
        for i in 0..10 {
            session
                .push_history(HistoryRole::Assistant, format!("msg {i}"))
                .await;
        }
        let recent = session.recent_history(3).await;
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[2].text, "msg 9");
    }

    #[tokio::test]
    async fn uploaded_image_round_trips_and_is_taken_once() {
        let session = new_session();
        assert!(!session.has_uploaded_image().await);
        session
            .set_uploaded_image(UploadedImage {
                media_type: "image/jpeg".into(),
                data: Bytes::from_static(b"\xff\xd8"),
            })
            .await;
        assert!(session.has_uploaded_image().await);
        let taken = session.take_uploaded_image().await;
        assert!(taken.is_some());
        assert!(!session.has_uploaded_image().await);
    }

    #[test]
    fn translator_mode_toggles() {
        let session = new_session();
        assert!(!session.translator_mode());
        session.set_translator_mode(true);
        assert!(session.translator_mode());
    }
}
