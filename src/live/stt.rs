//! Streaming STT adapter (C3): the single-worker request-generator
//! lifecycle, grounded on the original `stt_stream.py`'s thread-based
//! implementation but recast onto one tokio task per utterance.
//!
//! The critical constraint carried over from the original: most
//! streaming-recognition RPCs don't actually start until the caller
//! begins iterating the request stream. So the same task that builds the
//! request stream must also be the one driving it to completion — never
//! split "build the generator" and "consume responses" across two tasks,
//! or the RPC silently never starts.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Bound on the per-utterance request queue. Mirrors the original's
/// `maxsize=50` — small enough to cap memory, large enough that a
/// healthy consumer never drops a frame.
const REQUEST_QUEUE_CAPACITY: usize = 50;

/// One normalized recognition result from the vendor stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionEvent {
    pub transcript: String,
    pub confidence: f32,
    pub is_final: bool,
}

/// Errors from the vendor streaming-recognition adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SttError {
    #[error("recognizer unavailable: {0}")]
    RecognizerUnavailable(String),
    #[error("recognition stream failed: {0}")]
    StreamFailed(String),
}

pub type RequestStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;
pub type ResponseStream = Pin<Box<dyn Stream<Item = RecognitionEvent> + Send>>;

/// Vendor-agnostic streaming recognizer. The adapter calls this exactly
/// once per utterance, handing it a request stream sourced from the
/// pinned per-utterance queue; the vendor's own endpointing produces
/// `is_final` events on that returned response stream.
#[async_trait]
pub trait StreamingRecognizer: Send + Sync {
    async fn recognize(
        &self,
        requests: RequestStream,
        config: &RecognizerConfig,
    ) -> Result<ResponseStream, SttError>;
}

/// Per-utterance recognition configuration.
#[derive(Debug, Clone)]
pub struct RecognizerConfig {
    pub language_code: String,
    pub sample_rate_hz: u32,
}

/// Events the adapter schedules back onto the endpoint loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    Interim { text: String },
    Final { text: String, confidence: f32 },
}

/// One request-queue item. `Shutdown` terminates the worker's request
/// stream without ever being forwarded to the recognizer — sending a
/// real sentinel value to most vendor APIs raises a protocol error.
enum QueueItem {
    Frame(Bytes),
    Shutdown,
}

/// The live (active_queue, worker handle) pair. Invariant I1: one field
/// is `Some` iff the other is. Only ever mutated under the adapter's
/// own lock (I2), never read or written from anywhere else.
struct AdapterState {
    active_queue: Option<mpsc::Sender<QueueItem>>,
    worker: Option<JoinHandle<()>>,
}

/// Manages the streaming-recognition worker lifecycle for one session:
/// at most one worker running at a time, a freshly pinned queue per
/// utterance, and clean restart on endpointing.
pub struct SttAdapter {
    recognizer: Arc<dyn StreamingRecognizer>,
    config: Mutex<RecognizerConfig>,
    state: Mutex<AdapterState>,
    stop_signal: CancellationToken,
    events_tx: mpsc::UnboundedSender<SttEvent>,
    stream_close_wait: Duration,
}

impl SttAdapter {
    pub fn new(
        recognizer: Arc<dyn StreamingRecognizer>,
        config: RecognizerConfig,
        events_tx: mpsc::UnboundedSender<SttEvent>,
        stream_close_wait: Duration,
    ) -> Self {
        Self {
            recognizer,
            config: Mutex::new(config),
            state: Mutex::new(AdapterState { active_queue: None, worker: None }),
            stop_signal: CancellationToken::new(),
            events_tx,
            stream_close_wait,
        }
    }

    /// Update the recognizer language. Takes effect on the next
    /// utterance — an in-flight stream is not restarted mid-utterance.
    pub async fn set_language(&self, language_code: impl Into<String>) {
        self.config.lock().await.language_code = language_code.into();
    }

    /// Whether a worker is currently running.
    pub async fn is_active(&self) -> bool {
        let state = self.state.lock().await;
        state.worker.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Feed one audio frame into the pinned queue for the current
    /// utterance, starting a new worker if none is alive. The frame is
    /// enqueued before the worker is spawned so its first poll yields
    /// immediately rather than racing an empty queue.
    pub async fn push_audio_frame(&self, frame: Bytes) {
        let mut state = self.state.lock().await;
        let needs_start = match &state.worker {
            Some(handle) => handle.is_finished(),
            None => true,
        };

        if needs_start {
            let (tx, rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
            if tx.try_send(QueueItem::Frame(frame)).is_err() {
                tracing::error!("stt request queue full on first frame, this should not happen");
            }
            state.active_queue = Some(tx);
            let config = self.config.lock().await.clone();
            let handle = self.spawn_worker(rx, config);
            state.worker = Some(handle);
        } else if let Some(tx) = &state.active_queue {
            if tx.try_send(QueueItem::Frame(frame)).is_err() {
                tracing::warn!("stt request queue full, dropping audio frame");
            }
        } else {
            tracing::error!("invariant violated: worker alive but no active queue");
        }
    }

    fn spawn_worker(
        &self,
        rx: mpsc::Receiver<QueueItem>,
        config: RecognizerConfig,
    ) -> JoinHandle<()> {
        let recognizer = self.recognizer.clone();
        let stop_signal = self.stop_signal.clone();
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            let requests: RequestStream = Box::pin(
                ReceiverStream::new(rx)
                    .take_while(|item| std::future::ready(!matches!(item, QueueItem::Shutdown)))
                    .map(|item| match item {
                        QueueItem::Frame(b) => b,
                        QueueItem::Shutdown => unreachable!("filtered out by take_while"),
                    }),
            );

            let response_stream = match recognizer.recognize(requests, &config).await {
                Ok(stream) => stream,
                Err(error) => {
                    tracing::error!(%error, "failed to start streaming recognition");
                    return;
                }
            };
            tokio::pin!(response_stream);

            loop {
                tokio::select! {
                    _ = stop_signal.cancelled() => break,
                    next = response_stream.next() => {
                        match next {
                            Some(event) => {
                                let sent = if event.is_final {
                                    events_tx.send(SttEvent::Final {
                                        text: event.transcript,
                                        confidence: event.confidence,
                                    })
                                } else {
                                    events_tx.send(SttEvent::Interim { text: event.transcript })
                                };
                                if sent.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        })
    }

    /// Endpointing: close the current utterance's stream and pin a
    /// fresh queue for the next one. Safe to call with no worker alive.
    /// Snapshot-and-swap happens under the lock; the sentinel push and
    /// the wait for worker exit happen outside it.
    pub async fn close_and_restart_stream(&self) {
        let (worker, queue) = {
            let mut state = self.state.lock().await;
            (state.worker.take(), state.active_queue.take())
        };

        let Some(worker) = worker else {
            return;
        };

        if let Some(queue) = &queue {
            let _ = queue.send(QueueItem::Shutdown).await;
        }

        if tokio::time::timeout(self.stream_close_wait, worker).await.is_err() {
            tracing::warn!("stt worker did not exit within the close-wait window");
        }
    }

    /// Session-scope shutdown: signal every worker to stop, push the
    /// shutdown sentinel to whatever queue is active (even if no worker
    /// has started yet), and clear the adapter's pointers.
    pub async fn close(&self) {
        self.stop_signal.cancel();
        let (worker, queue) = {
            let mut state = self.state.lock().await;
            (state.worker.take(), state.active_queue.take())
        };
        if let Some(queue) = queue {
            let _ = queue.try_send(QueueItem::Shutdown);
        }
        if let Some(worker) = worker {
            worker.abort();
        }
    }
}
