//! In-process timers over the durable schedule table.
//!
//! The schedule rows themselves are committed by the store alongside the
//! instance save; this scheduler only arms a tokio timer per pending row
//! and, when one fires, publishes the stored message back onto the bus
//! tagged with its correlation id. After a restart, `rearm_pending` rebuilds
//! every timer from the persisted table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bus::MessageBus;
use chrono::Utc;
use common::CorrelationId;
use store::{SagaStore, ScheduledMessage};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::Result;

type TimerKey = (CorrelationId, String);

/// Arms and cancels timers for pending scheduled messages.
pub struct Scheduler<S, B> {
    store: Arc<S>,
    bus: Arc<B>,
    timers: Arc<Mutex<HashMap<TimerKey, JoinHandle<()>>>>,
}

impl<S, B> Clone for Scheduler<S, B> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
            timers: Arc::clone(&self.timers),
        }
    }
}

impl<S, B> Scheduler<S, B>
where
    S: SagaStore + 'static,
    B: MessageBus + 'static,
{
    /// Creates a scheduler over the given store and bus.
    pub fn new(store: Arc<S>, bus: Arc<B>) -> Self {
        Self {
            store,
            bus,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Arms a timer for a pending schedule.
    ///
    /// A live timer for the same `(correlation id, schedule name)` key is
    /// aborted first: one live timer per key, the newest wins.
    pub async fn arm(&self, schedule: ScheduledMessage) {
        let key = (schedule.correlation_id, schedule.schedule_name.clone());
        let token = schedule.token;
        let delay = (schedule.due_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        let store = Arc::clone(&self.store);
        let bus = Arc::clone(&self.bus);
        let timers = Arc::clone(&self.timers);
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(store, bus, timers, task_key, token).await;
        });

        let mut timers = self.timers.lock().await;
        if let Some(previous) = timers.insert(key, handle) {
            previous.abort();
        }
    }

    /// Disarms the timer for a key. Harmless no-op when none is armed.
    pub async fn disarm(&self, correlation_id: CorrelationId, schedule_name: &str) {
        let mut timers = self.timers.lock().await;
        if let Some(handle) = timers.remove(&(correlation_id, schedule_name.to_string())) {
            handle.abort();
        }
    }

    /// Re-arms timers for every persisted schedule. Called on startup;
    /// past-due schedules fire immediately.
    pub async fn rearm_pending(&self) -> Result<()> {
        let pending = self.store.pending_schedules().await?;
        let count = pending.len();
        for schedule in pending {
            self.arm(schedule).await;
        }
        tracing::info!(timers = count, "re-armed pending schedules");
        Ok(())
    }

    /// Returns the number of currently armed timers.
    pub async fn armed_count(&self) -> usize {
        self.timers.lock().await.len()
    }
}

/// Delivers a due schedule: publish first, then delete the row, so a crash
/// in between re-fires after restart rather than losing the message.
///
/// Only the exact schedule this timer was armed for is delivered. The row
/// may have been removed by a cancel, or replaced (fresh token) by a
/// re-schedule committed through another scheduler over the same store;
/// either way this timer's schedule no longer exists and the delivery
/// belongs to the newer timer.
async fn fire<S, B>(
    store: Arc<S>,
    bus: Arc<B>,
    timers: Arc<Mutex<HashMap<TimerKey, JoinHandle<()>>>>,
    key: TimerKey,
    token: common::ScheduleToken,
) where
    S: SagaStore,
    B: MessageBus,
{
    let (correlation_id, schedule_name) = &key;

    let row = match store.get_schedule(*correlation_id, schedule_name).await {
        Ok(row) => row,
        Err(e) => {
            tracing::error!(error = %e, %correlation_id, schedule_name, "failed to read schedule on expiry");
            None
        }
    };

    if let Some(schedule) = row.filter(|s| s.token == token) {
        let delivery = bus::Message::from_value(&schedule.message_type, schedule.payload)
            .correlated(schedule.correlation_id)
            .via_schedule(&schedule.schedule_name);
        if let Err(e) = bus.publish(delivery).await {
            tracing::error!(error = %e, %correlation_id, schedule_name, "failed to publish expired schedule");
        } else {
            metrics::counter!("saga_schedules_fired").increment(1);
            if let Err(e) = store.remove_schedule(*correlation_id, schedule_name).await {
                tracing::error!(error = %e, %correlation_id, schedule_name, "failed to clear fired schedule");
            }
        }
    }

    timers.lock().await.remove(&key);
}
