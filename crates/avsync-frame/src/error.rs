//! Error types for the frame module.

use thiserror::Error;

/// Errors that can occur when building frame containers.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Queue capacity must be at least one.
    #[error("Invalid queue capacity: {0}")]
    InvalidCapacity(usize),
}
