//! Clock authority interface.
//!
//! The clock authority owns the wall clock and mode register shared by all
//! legs of a playback session. Sessions never touch each other directly;
//! they share a [`SessionBinding`] wrapping one authority.

mod binding;
mod error;
mod soft;

pub use binding::SessionBinding;
pub use error::ClockError;
pub use soft::{ReportedPts, SoftClock};

use std::time::Duration;

use avsync_types::{
    ActiveStatus, AudioStartDecision, ClockEvent, LegType, Position, StartPolicy, SyncMode,
};
use crossbeam_channel::Receiver;

/// Tick interval of a 60 Hz display, in 90 kHz units.
pub const DEFAULT_VSYNC_INTERVAL: u32 = 1500;

/// Result type for clock authority operations.
pub type ClockResult<T> = Result<T, ClockError>;

/// Wall clock reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallClock {
    /// Current wall time, `None` until the clock is started.
    pub time: Option<u32>,

    /// Display tick interval in 90 kHz units.
    pub interval: u32,
}

/// The external authority owning the wall clock of a session.
///
/// Every operation is fallible; callers decide whether a failure is fatal.
pub trait ClockAuthority: Send + Sync {
    /// Id shared by all legs bound to this authority.
    fn session_id(&self) -> u32;

    /// Read the wall clock and tick interval.
    fn wall_clock(&self) -> ClockResult<WallClock>;

    fn set_mode(&self, mode: SyncMode) -> ClockResult<()>;
    fn mode(&self) -> ClockResult<SyncMode>;

    fn set_rate(&self, rate: f32) -> ClockResult<()>;
    fn rate(&self) -> ClockResult<f32>;

    /// Report the video timestamp displayed at `wall`.
    fn report_video_pts(&self, wall: u32, pts: u32, delay: u32) -> ClockResult<()>;

    /// Report the audio timestamp rendered at `wall`.
    fn report_audio_pts(&self, wall: u32, pts: u32, delay: u32) -> ClockResult<()>;

    fn signal_discontinuity(&self, leg: LegType, pts: u32) -> ClockResult<()>;

    fn signal_video_start(&self, pts: u32) -> ClockResult<()>;

    /// Announce the first audio timestamp and get the start decision.
    fn signal_audio_start(&self, pts: u32, delay: u32) -> ClockResult<AudioStartDecision>;

    fn signal_stop(&self, leg: LegType) -> ClockResult<()>;
    fn signal_pause(&self, paused: bool) -> ClockResult<()>;

    /// Active mode and leg activity. `clear_urgent` acknowledges the
    /// notification that woke the caller.
    fn active_status(&self, leg: LegType, clear_urgent: bool) -> ClockResult<ActiveStatus>;

    fn set_clock_deviation(&self, ppm: i32) -> ClockResult<()>;
    fn clock_deviation(&self) -> ClockResult<i32>;

    fn clock_started(&self) -> ClockResult<bool>;

    fn set_start_policy(&self, policy: StartPolicy, timeout_ms: i32) -> ClockResult<()>;
    fn start_policy(&self) -> ClockResult<(StartPolicy, i32)>;

    /// Buffering needed before a PCR master session starts, in ms.
    fn set_start_buffer_threshold(&self, ms: u32) -> ClockResult<()>;

    fn set_pcr(&self, pts: u32, mono_ns: u64) -> ClockResult<()>;
    fn pcr(&self) -> ClockResult<Position>;

    /// Discontinuity thresholds `(min, max)` in 90 kHz units.
    fn disc_thresholds(&self) -> ClockResult<(u32, u32)>;
    fn set_disc_thresholds(&self, min: u32, max: u32) -> ClockResult<()>;

    /// Largest wall/pts gap the authority absorbs by slewing.
    fn set_wall_adjust_threshold(&self, threshold: u32) -> ClockResult<()>;

    fn set_name(&self, name: &str) -> ClockResult<()>;

    fn set_audio_switch(&self, active: bool) -> ClockResult<()>;

    /// Wake an audio leg blocked in a start wait.
    fn release_audio_wait(&self) -> ClockResult<()>;

    /// Last reported position of a leg.
    fn position(&self, leg: LegType) -> ClockResult<Position>;

    /// Monotonic time used for idle and drop-duration tracking.
    fn monotonic_now(&self) -> Duration;

    /// Subscribe to out-of-band notifications.
    fn subscribe(&self) -> Receiver<ClockEvent>;
}
