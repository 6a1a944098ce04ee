//! Shared vocabulary for the A/V sync engine.
//!
//! Sync modes, leg kinds, session states, audio verdicts and the
//! wrap-aware 90 kHz timestamp helpers used by every other crate.

mod events;
mod mode;
mod state;
pub mod time;
mod types;

pub use events::ClockEvent;
pub use mode::{LegType, StartPolicy, SyncMode};
pub use state::{AudioSwitchState, SessionState};
pub use types::{
    ActiveStatus, AudioAction, AudioPolicy, AudioStartDecision, ClockRecoveryStatus, PausePts,
    Position, StartReason,
};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for clock authority notifications.
pub const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Creates a bounded notification channel.
pub fn event_channel() -> (Sender<ClockEvent>, Receiver<ClockEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
