//! Process-wide counters for visible degradations.
//!
//! Skipped TTS units, ignored second speakers, and provider fallbacks are
//! not errors; they are degradations that must stay observable. Counters
//! are cheap atomics shared behind an `Arc` and reported through the
//! health route and logs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Gateway-wide counters. All methods are lock-free.
#[derive(Debug, Default)]
pub struct Metrics {
    sessions_started: AtomicU64,
    turns_completed: AtomicU64,
    second_speaker_ignored: AtomicU64,
    llm_fallback_used: AtomicU64,
    tts_units_skipped: AtomicU64,
    stt_reconnects: AtomicU64,
    turns_shed: AtomicU64,
}

/// Point-in-time snapshot of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub sessions_started: u64,
    pub turns_completed: u64,
    pub second_speaker_ignored: u64,
    pub llm_fallback_used: u64,
    pub tts_units_skipped: u64,
    pub stt_reconnects: u64,
    pub turns_shed: u64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn turn_completed(&self) {
        self.turns_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// A second speaker tried to start during an active utterance and was
    /// ignored, not queued.
    pub fn second_speaker_ignored(&self) {
        self.second_speaker_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn llm_fallback_used(&self) {
        self.llm_fallback_used.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tts_unit_skipped(&self) {
        self.tts_units_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stt_reconnect(&self) {
        self.stt_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn turn_shed(&self) {
        self.turns_shed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
            second_speaker_ignored: self.second_speaker_ignored.load(Ordering::Relaxed),
            llm_fallback_used: self.llm_fallback_used.load(Ordering::Relaxed),
            tts_units_skipped: self.tts_units_skipped.load(Ordering::Relaxed),
            stt_reconnects: self.stt_reconnects.load(Ordering::Relaxed),
            turns_shed: self.turns_shed.load(Ordering::Relaxed),
        }
    }
}
