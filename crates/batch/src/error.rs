//! Error types for batch consumption.

use thiserror::Error;

/// Errors surfaced while flushing a batch.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The batch handler rejected a flushed window.
    #[error("batch handler failed: {0}")]
    Handler(String),
}

impl BatchError {
    /// Creates a handler failure with the given reason.
    pub fn handler(reason: impl Into<String>) -> Self {
        BatchError::Handler(reason.into())
    }
}

/// Convenience alias for batch results.
pub type Result<T> = std::result::Result<T, BatchError>;
