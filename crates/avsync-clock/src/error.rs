//! Error types for clock authority operations.

use thiserror::Error;

/// Errors reported by a clock authority.
#[derive(Debug, Error)]
pub enum ClockError {
    /// The authority could not be reached.
    #[error("Clock authority unavailable: {0}")]
    Unavailable(String),

    /// The authority refused the request.
    #[error("Clock authority rejected {0}")]
    Rejected(&'static str),

    /// The wall clock has not been started.
    #[error("Wall clock not started")]
    NotStarted,

    /// The session was closed.
    #[error("Session closed")]
    Closed,
}
