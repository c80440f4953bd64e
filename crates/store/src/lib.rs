//! Saga instance persistence.
//!
//! The store is the single source of truth for saga state. Every save
//! supplies the version it read; the store increments it atomically or
//! fails with a concurrency conflict. Pending schedules commit in the same
//! transaction as the instance they belong to, so a timer row can never
//! outlive or predate the state that created it.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod store;

pub use common::{CorrelationId, ScheduleToken};
pub use error::{Result, StoreError};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use record::{SagaRecord, ScheduleOp, ScheduledMessage, Version};
pub use store::SagaStore;
