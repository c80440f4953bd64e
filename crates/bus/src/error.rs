use thiserror::Error;

/// Errors that can occur when interacting with the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The transport rejected or lost the connection for a destination.
    #[error("bus transport error for '{destination}': {reason}")]
    Transport { destination: String, reason: String },

    /// A serialization/deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
