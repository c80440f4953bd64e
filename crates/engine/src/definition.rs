//! Saga type definitions: state sets and transition tables.
//!
//! A saga type is described declaratively: its full state enumeration, the
//! initial state, which event types may create a fresh instance, and a
//! transition table mapping `(state, event type)` pairs to a target state
//! and an effect builder. Lookups that miss the table are a deliberate
//! no-op, not an error.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bus::Message;
use common::CorrelationId;
use store::SagaRecord;
use thiserror::Error;

/// A side effect computed by a transition.
///
/// Effects are buffered in the outbox during the transition and dispatched
/// only after the instance save commits.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Send a message to a queue.
    Send {
        destination: String,
        message: Message,
    },

    /// Schedule a message for future delivery under a named schedule.
    ///
    /// Scheduling over a live schedule with the same name implicitly
    /// cancels the old one.
    Schedule {
        name: String,
        message: Message,
        delay: Duration,
    },

    /// Cancel the named schedule, if one is outstanding.
    Unschedule { name: String },

    /// Mark the instance completed. Terminal; later events are no-ops.
    Finalize,
}

/// Builds the effect list for a transition from the instance and the
/// triggering event.
pub type EffectFn = dyn Fn(&SagaRecord, &Message) -> Vec<Effect> + Send + Sync;

/// Extracts the correlation id for an event type from its payload.
pub type CorrelationFn = dyn Fn(&Message) -> Option<CorrelationId> + Send + Sync;

/// One entry of the transition table.
pub struct TransitionSpec {
    target_state: String,
    effects: Arc<EffectFn>,
}

impl TransitionSpec {
    /// The state the instance moves to.
    pub fn target_state(&self) -> &str {
        &self.target_state
    }

    /// Computes the effect list for this transition.
    pub fn effects(&self, record: &SagaRecord, message: &Message) -> Vec<Effect> {
        (self.effects)(record, message)
    }
}

/// Errors raised while building or registering a saga definition.
///
/// These are programming errors in the transition table and are surfaced
/// immediately, never retried.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// No initial state was declared.
    #[error("saga '{saga_type}' has no initial state")]
    MissingInitialState { saga_type: String },

    /// A state was referenced that is not in the declared state set.
    #[error("saga '{saga_type}' references undeclared state '{state}'")]
    UnknownState { saga_type: String, state: String },

    /// Two transitions were declared for the same (state, event type) pair.
    #[error("saga '{saga_type}' declares duplicate transition ({state}, {event_type})")]
    DuplicateTransition {
        saga_type: String,
        state: String,
        event_type: String,
    },

    /// No event type can create an instance of this saga.
    #[error("saga '{saga_type}' has no create trigger")]
    NoCreateTrigger { saga_type: String },

    /// An event type is claimed by more than one registered saga.
    #[error("event type '{event_type}' is claimed by both '{first}' and '{second}'")]
    AmbiguousEventType {
        event_type: String,
        first: String,
        second: String,
    },
}

/// A complete, validated saga type definition.
pub struct SagaDefinition {
    saga_type: String,
    initial_state: String,
    create_triggers: HashSet<String>,
    completed_states: HashSet<String>,
    correlations: HashMap<String, Arc<CorrelationFn>>,
    transitions: HashMap<(String, String), TransitionSpec>,
}

impl SagaDefinition {
    /// Starts building a definition for the named saga type.
    pub fn builder(saga_type: impl Into<String>) -> SagaDefinitionBuilder {
        SagaDefinitionBuilder::new(saga_type)
    }

    /// The saga type name.
    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    /// The state a fresh instance starts in.
    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    /// Returns true if the event type may create a new instance.
    pub fn is_create_trigger(&self, event_type: &str) -> bool {
        self.create_triggers.contains(event_type)
    }

    /// Returns true if reaching the state marks the instance completed.
    pub fn is_completed_state(&self, state: &str) -> bool {
        self.completed_states.contains(state)
    }

    /// Looks up the transition for a (state, event type) pair.
    pub fn transition(&self, state: &str, event_type: &str) -> Option<&TransitionSpec> {
        self.transitions
            .get(&(state.to_string(), event_type.to_string()))
    }

    /// Resolves the correlation id for a message: the registered extractor
    /// for its event type first, falling back to the envelope tag.
    pub fn resolve_correlation(&self, message: &Message) -> Option<CorrelationId> {
        if let Some(extract) = self.correlations.get(&message.message_type)
            && let Some(id) = extract(message)
        {
            return Some(id);
        }
        message.correlation_id
    }

    /// Every event type this definition reacts to.
    pub fn event_types(&self) -> HashSet<String> {
        let mut types: HashSet<String> = self.create_triggers.iter().cloned().collect();
        for (_, event_type) in self.transitions.keys() {
            types.insert(event_type.clone());
        }
        types
    }
}

/// Builder for [`SagaDefinition`]. `build` validates the whole table.
pub struct SagaDefinitionBuilder {
    saga_type: String,
    states: HashSet<String>,
    initial_state: Option<String>,
    create_triggers: HashSet<String>,
    completed_states: HashSet<String>,
    correlations: HashMap<String, Arc<CorrelationFn>>,
    transitions: Vec<(String, String, TransitionSpec)>,
}

impl SagaDefinitionBuilder {
    fn new(saga_type: impl Into<String>) -> Self {
        Self {
            saga_type: saga_type.into(),
            states: HashSet::new(),
            initial_state: None,
            create_triggers: HashSet::new(),
            completed_states: HashSet::new(),
            correlations: HashMap::new(),
            transitions: Vec::new(),
        }
    }

    /// Declares a state.
    pub fn state(mut self, name: impl Into<String>) -> Self {
        self.states.insert(name.into());
        self
    }

    /// Declares the initial state (also added to the state set).
    pub fn initial_state(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.states.insert(name.clone());
        self.initial_state = Some(name);
        self
    }

    /// Declares an event type that may create a fresh instance.
    pub fn create_on(mut self, event_type: impl Into<String>) -> Self {
        self.create_triggers.insert(event_type.into());
        self
    }

    /// Declares a state whose entry marks the instance completed.
    pub fn completed_state(mut self, name: impl Into<String>) -> Self {
        self.completed_states.insert(name.into());
        self
    }

    /// Registers a correlation extractor for an event type.
    pub fn correlate<F>(mut self, event_type: impl Into<String>, extract: F) -> Self
    where
        F: Fn(&Message) -> Option<CorrelationId> + Send + Sync + 'static,
    {
        self.correlations.insert(event_type.into(), Arc::new(extract));
        self
    }

    /// Declares a transition from `state` on `event_type` to `target`,
    /// with the given effect builder.
    pub fn transition<F>(
        mut self,
        state: impl Into<String>,
        event_type: impl Into<String>,
        target: impl Into<String>,
        effects: F,
    ) -> Self
    where
        F: Fn(&SagaRecord, &Message) -> Vec<Effect> + Send + Sync + 'static,
    {
        self.transitions.push((
            state.into(),
            event_type.into(),
            TransitionSpec {
                target_state: target.into(),
                effects: Arc::new(effects),
            },
        ));
        self
    }

    /// Validates and builds the definition.
    pub fn build(self) -> Result<SagaDefinition, DefinitionError> {
        let saga_type = self.saga_type;

        let initial_state =
            self.initial_state
                .ok_or_else(|| DefinitionError::MissingInitialState {
                    saga_type: saga_type.clone(),
                })?;

        if self.create_triggers.is_empty() {
            return Err(DefinitionError::NoCreateTrigger { saga_type });
        }

        for state in &self.completed_states {
            if !self.states.contains(state) {
                return Err(DefinitionError::UnknownState {
                    saga_type,
                    state: state.clone(),
                });
            }
        }

        let mut transitions = HashMap::new();
        for (state, event_type, spec) in self.transitions {
            for referenced in [&state, &spec.target_state] {
                if !self.states.contains(referenced) {
                    return Err(DefinitionError::UnknownState {
                        saga_type,
                        state: referenced.clone(),
                    });
                }
            }
            if transitions
                .insert((state.clone(), event_type.clone()), spec)
                .is_some()
            {
                return Err(DefinitionError::DuplicateTransition {
                    saga_type,
                    state,
                    event_type,
                });
            }
        }

        Ok(SagaDefinition {
            saga_type,
            initial_state,
            create_triggers: self.create_triggers,
            completed_states: self.completed_states,
            correlations: self.correlations,
            transitions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_effects(_: &SagaRecord, _: &Message) -> Vec<Effect> {
        Vec::new()
    }

    #[test]
    fn builds_a_minimal_definition() {
        let definition = SagaDefinition::builder("Allocation")
            .initial_state("Initial")
            .state("Allocated")
            .create_on("AllocationCreated")
            .transition("Initial", "AllocationCreated", "Allocated", no_effects)
            .build()
            .unwrap();

        assert_eq!(definition.saga_type(), "Allocation");
        assert_eq!(definition.initial_state(), "Initial");
        assert!(definition.is_create_trigger("AllocationCreated"));
        assert!(!definition.is_create_trigger("ReleaseRequested"));
        assert!(definition.transition("Initial", "AllocationCreated").is_some());
        assert!(definition.transition("Allocated", "AllocationCreated").is_none());
    }

    #[test]
    fn rejects_missing_initial_state() {
        let result = SagaDefinition::builder("Allocation")
            .state("Allocated")
            .create_on("AllocationCreated")
            .build();
        assert!(matches!(
            result,
            Err(DefinitionError::MissingInitialState { .. })
        ));
    }

    #[test]
    fn rejects_missing_create_trigger() {
        let result = SagaDefinition::builder("Allocation")
            .initial_state("Initial")
            .build();
        assert!(matches!(result, Err(DefinitionError::NoCreateTrigger { .. })));
    }

    #[test]
    fn rejects_undeclared_states_in_transitions() {
        let result = SagaDefinition::builder("Allocation")
            .initial_state("Initial")
            .create_on("AllocationCreated")
            .transition("Initial", "AllocationCreated", "Nowhere", no_effects)
            .build();
        assert!(matches!(
            result,
            Err(DefinitionError::UnknownState { state, .. }) if state == "Nowhere"
        ));
    }

    #[test]
    fn rejects_duplicate_transitions() {
        let result = SagaDefinition::builder("Allocation")
            .initial_state("Initial")
            .state("Allocated")
            .create_on("AllocationCreated")
            .transition("Initial", "AllocationCreated", "Allocated", no_effects)
            .transition("Initial", "AllocationCreated", "Initial", no_effects)
            .build();
        assert!(matches!(
            result,
            Err(DefinitionError::DuplicateTransition { .. })
        ));
    }

    #[test]
    fn rejects_undeclared_completed_state() {
        let result = SagaDefinition::builder("Allocation")
            .initial_state("Initial")
            .create_on("AllocationCreated")
            .completed_state("Done")
            .build();
        assert!(matches!(result, Err(DefinitionError::UnknownState { .. })));
    }

    #[test]
    fn correlation_extractor_takes_precedence_over_envelope() {
        let payload_id = CorrelationId::new();
        let envelope_id = CorrelationId::new();

        let definition = SagaDefinition::builder("Allocation")
            .initial_state("Initial")
            .create_on("AllocationCreated")
            .correlate("AllocationCreated", |m: &Message| {
                m.payload
                    .get("allocation_id")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
            })
            .build()
            .unwrap();

        let message = Message::from_value(
            "AllocationCreated",
            serde_json::json!({ "allocation_id": payload_id }),
        )
        .correlated(envelope_id);

        assert_eq!(definition.resolve_correlation(&message), Some(payload_id));
    }

    #[test]
    fn correlation_falls_back_to_envelope_tag() {
        let envelope_id = CorrelationId::new();
        let definition = SagaDefinition::builder("Allocation")
            .initial_state("Initial")
            .create_on("AllocationCreated")
            .build()
            .unwrap();

        let message =
            Message::from_value("HoldExpired", serde_json::json!({})).correlated(envelope_id);
        assert_eq!(definition.resolve_correlation(&message), Some(envelope_id));
    }

    #[test]
    fn event_types_cover_triggers_and_transitions() {
        let definition = SagaDefinition::builder("Allocation")
            .initial_state("Initial")
            .state("Allocated")
            .create_on("AllocationCreated")
            .transition("Allocated", "ReleaseRequested", "Allocated", no_effects)
            .build()
            .unwrap();

        let types = definition.event_types();
        assert!(types.contains("AllocationCreated"));
        assert!(types.contains("ReleaseRequested"));
        assert_eq!(types.len(), 2);
    }
}
