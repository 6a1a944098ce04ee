//! Clock synchronization engine.
//!
//! A [`SyncSession`] is one leg (video, audio or PCR) of a playback
//! session. Legs bound to the same clock authority share its wall clock:
//! the video leg decides once per display tick which queued frame to show,
//! the audio leg tells the renderer whether to render, drop or insert
//! silence, and the PCR leg estimates how far the local clock drifts from
//! the broadcast reference.

mod audio;
mod config;
mod error;
mod expiry;
mod pattern;
mod pcr;
mod poll;
mod reference;
mod session;
mod state;
mod stats;
mod video;

pub use config::{StartPolicyConfig, SyncConfig, UnderflowConfig, VideoConfig};
pub use error::SyncError;
pub use pattern::{Cadence, CadenceCounter, PatternDetector};
pub use pcr::{MonitorStatus, PcrMonitor, PcrSample};
pub use session::{AudioStartCallback, PtsCallback, SyncSession};
pub use stats::SessionStats;
pub use video::DisplayedFrame;

/// Result type for sync session operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Queue depth that ends buffering when the caller passes 0.
pub const DEFAULT_START_THRESHOLD: usize = 2;

/// Largest accepted start threshold.
pub const MAX_START_THRESHOLD: usize = 5;

/// Discontinuity thresholds used when the authority has none (1 s / 10 s).
pub const DEFAULT_DISC_THRES_MIN: u32 = 30_000;
pub const DEFAULT_DISC_THRES_MAX: u32 = 900_000;

/// Authority wall-adjust threshold at normal speed (100 ms).
pub const DEFAULT_WALL_ADJUST_THRESHOLD: u32 = 9000;

/// Gaps above this drop cadence history.
pub(crate) const PATTERN_RESET_THRESHOLD: u32 = 9000;

/// Timestamp jumps above this between consecutive items are stream errors.
pub(crate) const STREAM_DISC_THRESHOLD: u32 = 9000;
