//! Session statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time copy of a session's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub frames_pushed: u64,
    pub frames_toggled: u64,
    /// Frames skipped over within a single tick.
    pub frames_dropped: u64,
    pub outliers: u64,
    pub discontinuities: u64,
    pub pattern_breaks: u64,
    pub underflows: u64,
    pub sync_lost: u64,
    pub audio_drops: u64,
    pub audio_inserts: u64,
}

/// Lock-free counters updated from the tick paths.
#[derive(Debug, Default)]
pub struct SyncStats {
    frames_pushed: AtomicU64,
    frames_toggled: AtomicU64,
    frames_dropped: AtomicU64,
    outliers: AtomicU64,
    discontinuities: AtomicU64,
    pattern_breaks: AtomicU64,
    underflows: AtomicU64,
    sync_lost: AtomicU64,
    audio_drops: AtomicU64,
    audio_inserts: AtomicU64,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_push(&self) {
        self.frames_pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_toggle(&self) {
        self.frames_toggled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outlier(&self) {
        self.outliers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discontinuity(&self) {
        self.discontinuities.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pattern_break(&self) {
        self.pattern_breaks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_underflow(&self) {
        self.underflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_lost(&self) {
        self.sync_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_audio_drop(&self) {
        self.audio_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_audio_insert(&self) {
        self.audio_inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current counters.
    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            frames_toggled: self.frames_toggled.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            outliers: self.outliers.load(Ordering::Relaxed),
            discontinuities: self.discontinuities.load(Ordering::Relaxed),
            pattern_breaks: self.pattern_breaks.load(Ordering::Relaxed),
            underflows: self.underflows.load(Ordering::Relaxed),
            sync_lost: self.sync_lost.load(Ordering::Relaxed),
            audio_drops: self.audio_drops.load(Ordering::Relaxed),
            audio_inserts: self.audio_inserts.load(Ordering::Relaxed),
        }
    }
}
