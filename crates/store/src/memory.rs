use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    CorrelationId, Result, SagaRecord, ScheduleOp, ScheduledMessage, StoreError, Version,
    store::SagaStore,
};

/// In-memory saga store implementation for testing.
///
/// Instances and pending schedules live behind a single lock so a save and
/// its schedule mutations are atomic, matching the transactional contract of
/// the PostgreSQL implementation.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    inner: Arc<RwLock<StoreInner>>,
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<CorrelationId, (SagaRecord, Version)>,
    schedules: HashMap<(CorrelationId, String), ScheduledMessage>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored saga instances.
    pub async fn instance_count(&self) -> usize {
        self.inner.read().await.records.len()
    }

    /// Returns the number of pending schedules.
    pub async fn schedule_count(&self) -> usize {
        self.inner.read().await.schedules.len()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn load(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Option<(SagaRecord, Version)>> {
        Ok(self.inner.read().await.records.get(&correlation_id).cloned())
    }

    async fn save(
        &self,
        mut record: SagaRecord,
        expected_version: Version,
        schedule_ops: Vec<ScheduleOp>,
    ) -> Result<Version> {
        let correlation_id = record.correlation_id;
        let mut inner = self.inner.write().await;

        let actual = inner
            .records
            .get(&correlation_id)
            .map(|(_, v)| *v)
            .unwrap_or(Version::initial());

        if actual != expected_version {
            return Err(StoreError::ConcurrencyConflict {
                correlation_id,
                expected: expected_version,
                actual,
            });
        }

        let new_version = expected_version.next();
        record.updated_at = Utc::now();
        inner.records.insert(correlation_id, (record, new_version));

        for op in schedule_ops {
            match op {
                ScheduleOp::Insert(schedule) => {
                    let key = (schedule.correlation_id, schedule.schedule_name.clone());
                    inner.schedules.insert(key, schedule);
                }
                ScheduleOp::Remove {
                    correlation_id,
                    schedule_name,
                } => {
                    inner.schedules.remove(&(correlation_id, schedule_name));
                }
            }
        }

        Ok(new_version)
    }

    async fn pending_schedules(&self) -> Result<Vec<ScheduledMessage>> {
        let inner = self.inner.read().await;
        let mut schedules: Vec<_> = inner.schedules.values().cloned().collect();
        schedules.sort_by_key(|s| s.due_at);
        Ok(schedules)
    }

    async fn get_schedule(
        &self,
        correlation_id: CorrelationId,
        schedule_name: &str,
    ) -> Result<Option<ScheduledMessage>> {
        let inner = self.inner.read().await;
        Ok(inner
            .schedules
            .get(&(correlation_id, schedule_name.to_string()))
            .cloned())
    }

    async fn remove_schedule(
        &self,
        correlation_id: CorrelationId,
        schedule_name: &str,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .schedules
            .remove(&(correlation_id, schedule_name.to_string()))
            .is_some())
    }
}
