//! Out-of-band notifications from the clock authority.

use serde::{Deserialize, Serialize};

use crate::mode::SyncMode;

/// Raised by the clock authority; session poll threads wake on these and
/// re-read [`ActiveStatus`](crate::ActiveStatus).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockEvent {
    /// Active mode changed.
    ModeChanged(SyncMode),

    /// A leg became active, inactive or timed out.
    LegActivity,

    /// Audio switch flag toggled.
    AudioSwitch(bool),

    /// Debug free-run override toggled.
    DebugFreeRun(bool),

    /// Playback rate changed.
    RateChanged,
}
