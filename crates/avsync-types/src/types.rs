//! Verdicts and status snapshots exchanged with callers and the clock authority.

use serde::{Deserialize, Serialize};

use crate::mode::SyncMode;

/// What the audio renderer should do with a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioAction {
    Render,
    /// Chunk is late; skip it.
    Drop,
    /// Chunk is early; insert silence first.
    Insert,
}

/// Render verdict plus the wall clock minus pts distance in 90 kHz ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioPolicy {
    pub action: AudioAction,
    pub delta: i32,
}

impl AudioPolicy {
    pub fn render() -> Self {
        Self {
            action: AudioAction::Render,
            delta: 0,
        }
    }
}

/// Outcome of `audio_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioStartDecision {
    /// Render immediately.
    Sync,

    /// Block until the start callback fires.
    Async,

    /// Discard this chunk and retry with the next one.
    Again,
}

/// Reason passed to the asynchronous audio start callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartReason {
    /// Start rendering now.
    Ok,

    /// The wait was cancelled.
    Stop,
}

/// Readiness of the PCR-derived clock deviation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockRecoveryStatus {
    /// Session is not in PCR master mode.
    NotRunning,

    /// Still converging.
    Ongoing,

    /// A deviation is available.
    Ready,

    /// The clock authority could not be queried.
    Error,
}

/// Mode and activity flags as seen by the clock authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveStatus {
    /// Mode currently in effect, which may differ from the configured one.
    pub active_mode: SyncMode,
    pub video_active: bool,
    pub audio_active: bool,
    pub video_timeout: bool,
    pub audio_switch: bool,
    pub debug_free_run: bool,
}

impl Default for ActiveStatus {
    fn default() -> Self {
        Self {
            active_mode: SyncMode::default(),
            video_active: false,
            audio_active: false,
            video_timeout: false,
            audio_switch: false,
            debug_free_run: false,
        }
    }
}

/// Pause target armed with `set_pause_pts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PausePts {
    /// Show one more frame, then pause.
    Step,

    /// Pause once this timestamp is displayed.
    At(u32),
}

/// Last timestamp reported for a leg and the monotonic time of the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub pts: u32,
    pub mono_ns: u64,
}
