//! Metrics (C9): a ring buffer of per-turn timings plus a handful of
//! monotonic counters, with p50/p95 reporting.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Timing breakdown for a single completed turn, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnTiming {
    pub stt_ms: u64,
    pub llm_ms: u64,
    pub tts_ms: u64,
    pub e2e_ms: u64,
}

/// p50/p95 summary for one timing axis.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Percentiles {
    pub p50: u64,
    pub p95: u64,
}

/// A full metrics snapshot, suitable for serializing as the `/api/metrics`
/// JSON response.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MetricsReport {
    pub turns_recorded: usize,
    pub stt_ms: PercentilesJson,
    pub llm_ms: PercentilesJson,
    pub tts_ms: PercentilesJson,
    pub e2e_ms: PercentilesJson,
    pub tool_calls_total: u64,
    pub tool_failures_total: u64,
    pub transcripts_low_confidence_total: u64,
    pub audio_frames_dropped_total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct PercentilesJson {
    pub p50: u64,
    pub p95: u64,
}

impl From<Percentiles> for PercentilesJson {
    fn from(p: Percentiles) -> Self {
        Self { p50: p.p50, p95: p.p95 }
    }
}

/// Turn-latency ring buffer and counters, shared across a session's
/// orchestrator tasks (or, in a multi-session deployment, process-wide).
pub struct Metrics {
    capacity: usize,
    turns: Mutex<VecDeque<TurnTiming>>,
    tool_calls_total: AtomicU64,
    tool_failures_total: AtomicU64,
    transcripts_low_confidence_total: AtomicU64,
    audio_frames_dropped_total: AtomicU64,
}

impl Metrics {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            turns: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            tool_calls_total: AtomicU64::new(0),
            tool_failures_total: AtomicU64::new(0),
            transcripts_low_confidence_total: AtomicU64::new(0),
            audio_frames_dropped_total: AtomicU64::new(0),
        }
    }

    /// Record one completed turn's timing, evicting the oldest entry
    /// once the ring buffer is at capacity.
    pub fn record_turn(&self, timing: TurnTiming) {
        let mut turns = self.turns.lock().expect("metrics lock poisoned");
        turns.push_back(timing);
        while turns.len() > self.capacity {
            turns.pop_front();
        }
    }

    pub fn record_tool_call(&self) {
        self.tool_calls_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tool_failure(&self) {
        self.tool_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_low_confidence_transcript(&self) {
        self.transcripts_low_confidence_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_audio_frame(&self) {
        self.audio_frames_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Build a full report: p50/p95 per timing axis plus the raw
    /// counters.
    pub fn report(&self) -> MetricsReport {
        let turns = self.turns.lock().expect("metrics lock poisoned");
        let stt: Vec<u64> = turns.iter().map(|t| t.stt_ms).collect();
        let llm: Vec<u64> = turns.iter().map(|t| t.llm_ms).collect();
        let tts: Vec<u64> = turns.iter().map(|t| t.tts_ms).collect();
        let e2e: Vec<u64> = turns.iter().map(|t| t.e2e_ms).collect();
        MetricsReport {
            turns_recorded: turns.len(),
            stt_ms: percentiles(&stt).into(),
            llm_ms: percentiles(&llm).into(),
            tts_ms: percentiles(&tts).into(),
            e2e_ms: percentiles(&e2e).into(),
            tool_calls_total: self.tool_calls_total.load(Ordering::Relaxed),
            tool_failures_total: self.tool_failures_total.load(Ordering::Relaxed),
            transcripts_low_confidence_total: self
                .transcripts_low_confidence_total
                .load(Ordering::Relaxed),
            audio_frames_dropped_total: self.audio_frames_dropped_total.load(Ordering::Relaxed),
        }
    }
}

/// Nearest-rank percentile over an unsorted sample; empty input yields
/// zeros rather than panicking.
fn percentiles(samples: &[u64]) -> Percentiles {
    if samples.is_empty() {
        return Percentiles::default();
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    Percentiles {
        p50: percentile_of(&sorted, 0.50),
        p95: percentile_of(&sorted, 0.95),
    }
}

fn percentile_of(sorted: &[u64], fraction: f64) -> u64 {
    let len = sorted.len();
    if len == 1 {
        return sorted[0];
    }
    let rank = ((len - 1) as f64 * fraction).round() as usize;
    sorted[rank.min(len - 1)]
}
