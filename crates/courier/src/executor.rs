//! Runs routing slips forward and unwinds them on failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;

use crate::activity::Activity;
use crate::error::{ActivityError, CourierError, Result};
use crate::slip::{ActivityLog, RoutingSlip};

/// A compensation that itself failed during the unwind.
#[derive(Debug, Clone)]
pub struct CompensationFailure {
    /// The activity whose compensation failed.
    pub activity: String,

    /// The failure it reported.
    pub error: ActivityError,
}

/// Terminal outcome of one routing slip.
#[derive(Debug)]
pub enum SlipOutcome {
    /// Every forward action completed, in itinerary order.
    Completed {
        /// Compensation logs, in completion order.
        logs: Vec<ActivityLog>,
    },

    /// A forward action failed and completed work was unwound.
    Faulted {
        /// The activity whose forward action failed.
        failed_activity: String,

        /// The failure it reported.
        error: ActivityError,

        /// Activities compensated during the unwind, in unwind order.
        compensated: Vec<String>,

        /// Compensations that themselves failed; the unwind continued past
        /// each of these.
        compensation_failures: Vec<CompensationFailure>,
    },
}

impl SlipOutcome {
    /// Returns true if every forward action completed.
    pub fn is_completed(&self) -> bool {
        matches!(self, SlipOutcome::Completed { .. })
    }
}

struct RegisteredActivity {
    activity: Arc<dyn Activity>,
    limiter: Arc<Semaphore>,
}

/// Executes routing slips against a registry of named activities.
///
/// Activities are registered at wiring time with a per-activity concurrency
/// limit; afterwards the executor is shared behind an `Arc` and driven from
/// any number of tasks.
#[derive(Default)]
pub struct RoutingSlipExecutor {
    activities: HashMap<String, RegisteredActivity>,
}

impl RoutingSlipExecutor {
    /// Creates an executor with no registered activities.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an activity, bounding its forward actions to
    /// `concurrent_limit` at a time across all slips.
    pub fn register(&mut self, activity: Arc<dyn Activity>, concurrent_limit: usize) {
        let name = activity.name().to_string();
        self.activities.insert(
            name,
            RegisteredActivity {
                activity,
                limiter: Arc::new(Semaphore::new(concurrent_limit)),
            },
        );
    }

    /// Runs a slip to its terminal outcome.
    ///
    /// The whole itinerary is validated before any forward action runs;
    /// an unknown activity name is an executor error, not a fault. A
    /// forward-action failure halts the itinerary and compensates the
    /// completed prefix in strict reverse order, best effort.
    #[tracing::instrument(skip(self, slip), fields(tracking_id = %slip.tracking_id()))]
    pub async fn execute(&self, slip: RoutingSlip) -> Result<SlipOutcome> {
        for step in slip.itinerary() {
            if !self.activities.contains_key(&step.activity) {
                return Err(CourierError::UnknownActivity {
                    activity: step.activity.clone(),
                });
            }
        }

        let started = Instant::now();
        let mut logs: Vec<ActivityLog> = Vec::new();

        for step in slip.itinerary() {
            let registered = &self.activities[&step.activity];
            let _permit = registered
                .limiter
                .acquire()
                .await
                .map_err(|_| CourierError::ExecutorClosed)?;

            match registered.activity.execute(&step.arguments).await {
                Ok(data) => {
                    tracing::debug!(activity = %step.activity, "forward action completed");
                    logs.push(ActivityLog {
                        activity: step.activity.clone(),
                        data,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        activity = %step.activity,
                        error = %error,
                        completed = logs.len(),
                        "forward action failed, unwinding"
                    );
                    let (compensated, compensation_failures) = self.unwind(logs).await;
                    metrics::counter!("routing_slips_faulted").increment(1);
                    metrics::histogram!("routing_slip_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    return Ok(SlipOutcome::Faulted {
                        failed_activity: step.activity.clone(),
                        error,
                        compensated,
                        compensation_failures,
                    });
                }
            }
        }

        metrics::counter!("routing_slips_completed").increment(1);
        metrics::histogram!("routing_slip_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        Ok(SlipOutcome::Completed { logs })
    }

    /// Compensates completed logs in reverse order. A failed compensation
    /// is recorded and the unwind continues with the next log.
    async fn unwind(&self, logs: Vec<ActivityLog>) -> (Vec<String>, Vec<CompensationFailure>) {
        let mut compensated = Vec::new();
        let mut failures = Vec::new();

        for log in logs.into_iter().rev() {
            let registered = &self.activities[&log.activity];
            match registered.activity.compensate(&log.data).await {
                Ok(()) => {
                    tracing::debug!(activity = %log.activity, "compensated");
                    compensated.push(log.activity);
                }
                Err(error) => {
                    tracing::error!(
                        activity = %log.activity,
                        error = %error,
                        "compensation failed"
                    );
                    metrics::counter!("routing_slip_compensation_failures").increment(1);
                    failures.push(CompensationFailure {
                        activity: log.activity,
                        error,
                    });
                }
            }
        }

        (compensated, failures)
    }
}
