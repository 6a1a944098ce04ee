//! Owned video frames and the bounded queue they wait in.
//!
//! A [`Frame`] carries an opaque payload, its presentation timestamp and a
//! release callback. The callback runs exactly once, when the frame is
//! dropped, so whoever owns the frame last decides when it is returned.

mod error;
mod frame;
mod queue;

pub use error::FrameError;
pub use frame::{Frame, ReleaseFn};
pub use queue::FrameQueue;

/// Default queue depth for a video leg.
pub const MAX_FRAME_NUM: usize = 32;

/// Result type for frame operations.
pub type FrameResult<T> = Result<T, FrameError>;
