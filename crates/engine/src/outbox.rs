//! Buffer-then-commit outbox for transition effects.
//!
//! Outbound sends and schedule changes requested during one transition are
//! accumulated here instead of hitting the bus directly. The buffer is
//! flushed only after the instance save commits; dropping an unflushed
//! outbox (failed or retried attempt) discards its effects, so a retry can
//! never double-send.

use bus::{Message, MessageBus};
use common::CorrelationId;
use store::{ScheduleOp, ScheduledMessage};

use crate::Result;
use crate::scheduler::Scheduler;

/// In-memory buffer of the effects of a single transition.
#[derive(Default)]
pub struct Outbox {
    sends: Vec<(String, Message)>,
    schedules: Vec<ScheduledMessage>,
    cancels: Vec<(CorrelationId, String)>,
}

impl Outbox {
    /// Creates an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a queue send.
    pub fn send(&mut self, destination: impl Into<String>, message: Message) {
        self.sends.push((destination.into(), message));
    }

    /// Buffers a new schedule.
    pub fn schedule(&mut self, schedule: ScheduledMessage) {
        self.schedules.push(schedule);
    }

    /// Buffers a schedule cancellation.
    pub fn unschedule(&mut self, correlation_id: CorrelationId, schedule_name: impl Into<String>) {
        self.cancels.push((correlation_id, schedule_name.into()));
    }

    /// Returns true if nothing was buffered.
    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.schedules.is_empty() && self.cancels.is_empty()
    }

    /// The schedule-table mutations to commit alongside the instance save.
    pub fn schedule_ops(&self) -> Vec<ScheduleOp> {
        let mut ops: Vec<ScheduleOp> = self
            .cancels
            .iter()
            .map(|(correlation_id, schedule_name)| ScheduleOp::Remove {
                correlation_id: *correlation_id,
                schedule_name: schedule_name.clone(),
            })
            .collect();
        ops.extend(self.schedules.iter().cloned().map(ScheduleOp::Insert));
        ops
    }

    /// Dispatches the buffered effects. Called only after the save commits.
    ///
    /// Cancellations are applied before new schedules so a transition that
    /// unschedules and reschedules the same name lands with one live timer.
    pub async fn flush<S, B>(self, bus: &B, scheduler: &Scheduler<S, B>) -> Result<()>
    where
        S: store::SagaStore + 'static,
        B: MessageBus + 'static,
    {
        for (correlation_id, schedule_name) in self.cancels {
            scheduler.disarm(correlation_id, &schedule_name).await;
        }
        for (destination, message) in self.sends {
            bus.send(&destination, message).await?;
        }
        for schedule in self.schedules {
            scheduler.arm(schedule).await;
        }
        Ok(())
    }
}
