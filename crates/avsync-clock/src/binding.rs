//! Shared handle tying the legs of a playback session together.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::ClockAuthority;

/// Reference-counted handle on a clock authority.
///
/// Every leg of a session holds a clone; the session is closed when the
/// last clone is dropped.
#[derive(Clone)]
pub struct SessionBinding {
    id: u32,
    clock: Arc<dyn ClockAuthority>,
}

impl SessionBinding {
    /// Open a session on `clock`.
    pub fn open(clock: Arc<dyn ClockAuthority>) -> Self {
        let id = clock.session_id();
        debug!(session = id, "session opened");
        Self { id, clock }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn clock(&self) -> &Arc<dyn ClockAuthority> {
        &self.clock
    }

    /// Strong references to the authority, this handle included.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.clock)
    }
}

impl fmt::Debug for SessionBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBinding").field("id", &self.id).finish()
    }
}
