//! Video frame type.

use std::fmt;

use bytes::Bytes;

/// Callback returning a frame to its producer.
pub type ReleaseFn = Box<dyn FnOnce(&Frame) + Send + Sync>;

/// A video frame waiting for, or undergoing, display.
///
/// Move-only. The release callback runs when the frame is dropped, so it
/// fires exactly once no matter which path retires the frame.
pub struct Frame {
    payload: Bytes,
    pts: u32,
    duration: u32,
    mono_ns: u64,
    sequence: u64,
    hold_period: u32,
    outlier: bool,
    release: Option<ReleaseFn>,
}

impl Frame {
    /// Create a frame. A `duration` of 0 means unknown.
    pub fn new(payload: Bytes, pts: u32, duration: u32) -> Self {
        Self {
            payload,
            pts,
            duration,
            mono_ns: 0,
            sequence: 0,
            hold_period: 0,
            outlier: false,
            release: None,
        }
    }

    /// Attach the release callback.
    pub fn with_release<F>(mut self, release: F) -> Self
    where
        F: FnOnce(&Frame) + Send + Sync + 'static,
    {
        self.release = Some(Box::new(release));
        self
    }

    /// Monotonic presentation time, used by the mono-clock video mode.
    pub fn with_mono_time(mut self, mono_ns: u64) -> Self {
        self.mono_ns = mono_ns;
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn pts(&self) -> u32 {
        self.pts
    }

    pub fn duration(&self) -> u32 {
        self.duration
    }

    pub fn mono_time_ns(&self) -> u64 {
        self.mono_ns
    }

    /// Push order, assigned by the session.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Display ticks this frame has been held for.
    pub fn hold_period(&self) -> u32 {
        self.hold_period
    }

    pub fn reset_hold_period(&mut self) {
        self.hold_period = 0;
    }

    /// Count one more display tick.
    pub fn hold(&mut self) {
        self.hold_period = self.hold_period.saturating_add(1);
    }

    /// Flag as a stream outlier: its timestamp is not trusted.
    pub fn mark_outlier(&mut self) {
        self.outlier = true;
    }

    pub fn is_outlier(&self) -> bool {
        self.outlier
    }

    /// Return the frame to its producer now.
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("pts", &self.pts)
            .field("duration", &self.duration)
            .field("hold_period", &self.hold_period)
            .field("outlier", &self.outlier)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(self);
        }
    }
}
