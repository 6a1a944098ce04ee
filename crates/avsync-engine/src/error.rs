//! Error types for sync sessions.

use thiserror::Error;

use avsync_clock::ClockError;
use avsync_frame::{Frame, FrameError};
use avsync_types::{StartPolicy, SyncMode};

/// Errors that can occur during sync session operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Video delay must be 1 or 2 ticks.
    #[error("Invalid video delay: {0}")]
    InvalidDelay(u32),

    /// Playback speed outside [0.001, 100].
    #[error("Speed out of range: {0}")]
    InvalidSpeed(f32),

    /// Start threshold above the allowed maximum.
    #[error("Start threshold out of range: {0}")]
    InvalidStartThreshold(usize),

    /// Start policy not usable in the session's mode.
    #[error("Start policy {policy:?} not supported in {mode:?} mode")]
    UnsupportedPolicy { policy: StartPolicy, mode: SyncMode },

    /// Configuration rejected by validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The frame queue is full; the frame is handed back.
    #[error("Frame queue full")]
    QueueFull(Frame),

    /// Operation called on the wrong kind of leg.
    #[error("Operation requires a {expected} leg, session is {actual}")]
    WrongLeg {
        expected: &'static str,
        actual: &'static str,
    },

    /// Operation ignored in the current mode.
    #[error("Not supported: {0}")]
    NotSupported(&'static str),

    /// `audio_start` decided on an asynchronous start without a callback.
    #[error("Asynchronous audio start requires a callback")]
    MissingCallback,

    /// Audio switch requested while a leg is inactive.
    #[error("Audio switch needs both legs active (video {video}, audio {audio})")]
    LegsInactive { video: bool, audio: bool },

    /// The poll thread could not be started.
    #[error("Failed to spawn poll thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// Clock authority failure.
    #[error(transparent)]
    Clock(#[from] ClockError),

    /// Frame container failure.
    #[error(transparent)]
    Frame(#[from] FrameError),
}
