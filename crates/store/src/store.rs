use async_trait::async_trait;

use crate::{CorrelationId, Result, SagaRecord, ScheduleOp, ScheduledMessage, Version};

/// Core trait for saga store implementations.
///
/// The store provides compare-and-swap style updates: every save carries the
/// version the caller read, and the store fails with
/// [`StoreError::ConcurrencyConflict`](crate::StoreError::ConcurrencyConflict)
/// when that version is stale. The pending-schedule table is mutated in the
/// same transaction as the instance, keeping timers consistent with state.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Loads a saga instance and its current version by correlation id.
    ///
    /// Returns `None` when no instance exists for the id.
    async fn load(&self, correlation_id: CorrelationId)
    -> Result<Option<(SagaRecord, Version)>>;

    /// Atomically persists an instance together with its schedule mutations.
    ///
    /// `expected_version` must be [`Version::initial`] for a new instance,
    /// or the version returned by the `load` the caller acted on. On success
    /// the instance is stored at `expected_version.next()`, which is
    /// returned.
    async fn save(
        &self,
        record: SagaRecord,
        expected_version: Version,
        schedule_ops: Vec<ScheduleOp>,
    ) -> Result<Version>;

    /// Returns every pending schedule, ordered by due time.
    ///
    /// Used by the scheduler to re-arm timers after a process restart.
    async fn pending_schedules(&self) -> Result<Vec<ScheduledMessage>>;

    /// Loads the pending schedule for a key, if one exists.
    async fn get_schedule(
        &self,
        correlation_id: CorrelationId,
        schedule_name: &str,
    ) -> Result<Option<ScheduledMessage>>;

    /// Removes a pending schedule after it fired.
    ///
    /// Returns true if a schedule row existed for the key.
    async fn remove_schedule(
        &self,
        correlation_id: CorrelationId,
        schedule_name: &str,
    ) -> Result<bool>;
}
