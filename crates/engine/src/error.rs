//! Engine error types.

use bus::BusError;
use store::StoreError;
use thiserror::Error;

use crate::definition::DefinitionError;

/// Errors that can occur while handling an event.
///
/// Unroutable events are not errors; they resolve to an
/// [`EngineResult::Ignored`](crate::EngineResult::Ignored) disposition.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A saga definition is malformed. Programming error, never retried.
    #[error("definition error: {0}")]
    Definition(#[from] DefinitionError),

    /// Saga store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Message bus error.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The consumer's semaphore was closed during shutdown.
    #[error("consumer is shut down")]
    ConsumerClosed,
}

impl EngineError {
    /// Returns true if the error is worth retrying.
    ///
    /// Store and transport failures are treated as transient; an escaped
    /// concurrency conflict also counts, since it is resolved by
    /// reprocessing against fresh state. Definition and serialization
    /// errors are defects and surface immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Store(StoreError::Serialization(_)) => false,
            EngineError::Store(_) => true,
            EngineError::Bus(BusError::Transport { .. }) => true,
            EngineError::Bus(_) => false,
            EngineError::Definition(_)
            | EngineError::Serialization(_)
            | EngineError::ConsumerClosed => false,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
