//! The activity seam: a forward action paired with its compensation.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ActivityError;

/// One step of a routing slip.
///
/// `execute` performs the forward action and returns a compensation log,
/// the data `compensate` later needs to undo the work. Both sides take and
/// return JSON so the executor stays agnostic of activity argument types.
#[async_trait]
pub trait Activity: Send + Sync {
    /// The name the itinerary refers to this activity by.
    fn name(&self) -> &str;

    /// Performs the forward action and returns its compensation log.
    async fn execute(&self, arguments: &Value) -> std::result::Result<Value, ActivityError>;

    /// Undoes a previously completed forward action using its log.
    async fn compensate(&self, log: &Value) -> std::result::Result<(), ActivityError>;
}
