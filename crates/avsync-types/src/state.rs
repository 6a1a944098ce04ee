//! Session and audio-switch state machines.

use serde::{Deserialize, Serialize};

/// Sync state of a session leg.
///
/// `Init -> Running -> SyncSetup <-> SyncLost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionState {
    /// Buffering until the start threshold is reached.
    Init,

    /// Draining, nothing matched the clock yet.
    Running,

    /// Locked to the wall clock.
    SyncSetup,

    /// A discontinuity broke the lock.
    SyncLost,
}

impl SessionState {
    pub fn is_init(&self) -> bool {
        matches!(self, Self::Init)
    }

    /// Running, locked or re-acquiring.
    pub fn is_started(&self) -> bool {
        !self.is_init()
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, Self::SyncSetup)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::SyncSetup => "sync_setup",
            Self::SyncLost => "sync_lost",
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Init
    }
}

/// Progress of a seamless audio track switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioSwitchState {
    /// No switch, or switch just requested.
    Init,

    /// Audio restarted; the next start must resynchronise.
    Reset,

    /// New track started, converging on the wall clock.
    Start,

    /// Converged; the switch completes on the next render.
    Finish,

    /// Start was too late; retry with the next chunk.
    Again,
}

impl AudioSwitchState {
    /// States in which `audio_start` re-evaluates the start point.
    pub fn needs_resync(&self) -> bool {
        matches!(self, Self::Reset | Self::Again)
    }
}

impl Default for AudioSwitchState {
    fn default() -> Self {
        Self::Init
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(SessionState::Init < SessionState::Running);
        assert!(SessionState::Running < SessionState::SyncSetup);
        assert!(SessionState::SyncLost.is_started());
        assert!(!SessionState::Init.is_started());
        assert!(SessionState::SyncSetup.is_locked());
        assert!(!SessionState::SyncLost.is_locked());
    }

    #[test]
    fn test_switch_resync_states() {
        assert!(AudioSwitchState::Reset.needs_resync());
        assert!(AudioSwitchState::Again.needs_resync());
        assert!(!AudioSwitchState::Start.needs_resync());
    }
}
