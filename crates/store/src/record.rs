use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CorrelationId, ScheduleToken};

/// Version number for a saga instance, used for optimistic concurrency
/// control.
///
/// Versions start at 1 for a freshly created instance and increment by 1 on
/// every committed transition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) for a not-yet-persisted instance.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the first persisted version (1).
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// The persistent state of one saga instance.
///
/// Created on the first event that correlates to a new id; mutated only by
/// the state machine engine via committed transitions; never deleted by the
/// engine; `completed` marks the terminal state, archival is a collaborator
/// concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaRecord {
    /// The correlation id identifying this instance. Immutable once created.
    pub correlation_id: CorrelationId,

    /// The saga type that owns this instance (e.g. "Allocation").
    pub saga_type: String,

    /// The name of the active state, from the saga type's declared state set.
    pub current_state: String,

    /// True once the instance reached a terminal state. Further events for
    /// this id produce no side effects.
    pub completed: bool,

    /// Outstanding scheduled messages, keyed by schedule name. At most one
    /// token per name.
    pub scheduled_tokens: HashMap<String, ScheduleToken>,

    /// When the instance was created.
    pub created_at: DateTime<Utc>,

    /// When the instance was last saved.
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    /// Creates a fresh instance in the given initial state.
    pub fn new(
        correlation_id: CorrelationId,
        saga_type: impl Into<String>,
        initial_state: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            correlation_id,
            saga_type: saga_type.into(),
            current_state: initial_state.into(),
            completed: false,
            scheduled_tokens: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A persisted scheduled message, owned by the scheduler.
///
/// Exactly one may exist per `(correlation_id, schedule_name)` pair;
/// inserting over a live one replaces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMessage {
    /// The saga instance the message will be delivered to.
    pub correlation_id: CorrelationId,

    /// The schedule name within the saga definition (e.g. "HoldExpiration").
    pub schedule_name: String,

    /// Token identifying this in-flight schedule.
    pub token: ScheduleToken,

    /// When the message becomes due.
    pub due_at: DateTime<Utc>,

    /// The type of the message to deliver.
    pub message_type: String,

    /// The message payload as JSON.
    pub payload: serde_json::Value,
}

/// A schedule-table mutation committed atomically with an instance save.
#[derive(Debug, Clone)]
pub enum ScheduleOp {
    /// Insert a pending schedule, replacing any live one for the same key.
    Insert(ScheduledMessage),

    /// Remove the pending schedule for a key, if present.
    Remove {
        correlation_id: CorrelationId,
        schedule_name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        let v1 = Version::new(1);
        let v2 = Version::new(2);
        assert!(v1 < v2);
        assert_eq!(v1.next(), v2);
    }

    #[test]
    fn version_initial_and_first() {
        assert_eq!(Version::initial().as_i64(), 0);
        assert_eq!(Version::first().as_i64(), 1);
        assert_eq!(Version::initial().next(), Version::first());
    }

    #[test]
    fn new_record_starts_uncompleted_with_no_tokens() {
        let record = SagaRecord::new(CorrelationId::new(), "Allocation", "Initial");
        assert_eq!(record.saga_type, "Allocation");
        assert_eq!(record.current_state, "Initial");
        assert!(!record.completed);
        assert!(record.scheduled_tokens.is_empty());
    }

    #[test]
    fn record_serialization_roundtrip() {
        let mut record = SagaRecord::new(CorrelationId::new(), "Allocation", "Allocated");
        record
            .scheduled_tokens
            .insert("HoldExpiration".to_string(), ScheduleToken::new());

        let json = serde_json::to_string(&record).unwrap();
        let decoded: SagaRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.correlation_id, record.correlation_id);
        assert_eq!(decoded.current_state, "Allocated");
        assert_eq!(decoded.scheduled_tokens, record.scheduled_tokens);
    }
}
