//! Error types for routing slip execution.

use thiserror::Error;

/// A failure raised by an activity's forward action or compensation.
///
/// Activity failures are business outcomes, not executor errors: a failed
/// forward action triggers the unwind and is reported in the slip outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ActivityError {
    message: String,
}

impl ActivityError {
    /// Creates an activity error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors raised by the executor itself.
#[derive(Debug, Error)]
pub enum CourierError {
    /// The slip's itinerary references an activity no one registered.
    /// Raised before any forward action runs.
    #[error("routing slip references unknown activity '{activity}'")]
    UnknownActivity { activity: String },

    /// The executor's concurrency limiter was closed during shutdown.
    #[error("activity executor is closed")]
    ExecutorClosed,
}

/// Convenience alias for courier results.
pub type Result<T> = std::result::Result<T, CourierError>;
