//! The saga state machine engine.
//!
//! One `handle` call is one transition attempt: resolve the definition and
//! correlation id, load or create the instance, look up the transition,
//! buffer its effects in the outbox, commit the save, then dispatch. Events
//! for the same correlation id are serialized; distinct ids proceed in
//! parallel.

use std::collections::HashMap;
use std::sync::Arc;

use bus::{Message, MessageBus};
use chrono::{Duration as ChronoDuration, Utc};
use common::{CorrelationId, ScheduleToken};
use store::{SagaRecord, SagaStore, ScheduledMessage, Version};
use tokio::sync::Mutex;

use crate::definition::{DefinitionError, Effect, SagaDefinition};
use crate::error::{EngineError, Result};
use crate::outbox::Outbox;
use crate::scheduler::Scheduler;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How many times a transition is reprocessed against fresh state after
    /// an optimistic-concurrency conflict before the conflict surfaces.
    pub max_save_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_save_attempts: 5,
        }
    }
}

/// Why an event produced no transition.
///
/// None of these are errors: unroutable events are an expected part of
/// at-least-once delivery and are dropped with a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// No registered saga reacts to this event type.
    UnknownEventType,

    /// No correlation id could be resolved for the event.
    MissingCorrelation,

    /// No instance exists and the event type cannot create one.
    NotCreatable,

    /// The instance's current state has no transition for this event type.
    UndefinedTransition,

    /// The instance already reached a terminal state.
    AlreadyFinalized,
}

/// Outcome of handling one event.
#[derive(Debug, Clone)]
pub enum EngineResult {
    /// A transition was committed and its effects dispatched.
    Applied {
        correlation_id: CorrelationId,
        saga_type: String,
        from_state: String,
        to_state: String,
        finalized: bool,
        version: Version,
    },

    /// The event was dropped without touching any instance state.
    Ignored(Disposition),
}

impl EngineResult {
    /// Returns true if a transition was committed.
    pub fn is_applied(&self) -> bool {
        matches!(self, EngineResult::Applied { .. })
    }
}

/// Orchestrates saga transitions over a store and a bus.
///
/// Definitions are registered at wiring time; afterwards the engine is
/// shared behind an `Arc` and driven concurrently by consumers.
pub struct SagaEngine<S, B> {
    store: Arc<S>,
    bus: Arc<B>,
    scheduler: Scheduler<S, B>,
    config: EngineConfig,
    definitions: HashMap<String, Arc<SagaDefinition>>,
    routes: HashMap<String, String>,
    locks: Mutex<HashMap<CorrelationId, Arc<Mutex<()>>>>,
}

impl<S, B> SagaEngine<S, B>
where
    S: SagaStore + 'static,
    B: MessageBus + 'static,
{
    /// Creates an engine with the default configuration.
    pub fn new(store: S, bus: B) -> Self {
        Self::with_config(store, bus, EngineConfig::default())
    }

    /// Creates an engine with an explicit configuration.
    pub fn with_config(store: S, bus: B, config: EngineConfig) -> Self {
        let store = Arc::new(store);
        let bus = Arc::new(bus);
        let scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&bus));
        Self {
            store,
            bus,
            scheduler,
            config,
            definitions: HashMap::new(),
            routes: HashMap::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a saga definition and routes its event types.
    ///
    /// Each event type may belong to exactly one registered saga.
    pub fn register(&mut self, definition: SagaDefinition) -> Result<()> {
        let saga_type = definition.saga_type().to_string();
        for event_type in definition.event_types() {
            if let Some(existing) = self.routes.get(&event_type)
                && existing != &saga_type
            {
                return Err(DefinitionError::AmbiguousEventType {
                    event_type,
                    first: existing.clone(),
                    second: saga_type,
                }
                .into());
            }
            self.routes.insert(event_type, saga_type.clone());
        }
        self.definitions.insert(saga_type, Arc::new(definition));
        Ok(())
    }

    /// Gets a reference to the underlying bus.
    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    /// Gets a reference to the underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Re-arms timers for persisted schedules. Called once at startup.
    pub async fn restore_schedules(&self) -> Result<()> {
        self.scheduler.rearm_pending().await
    }

    /// Handles one inbound event.
    ///
    /// Events for the same correlation id are processed one at a time; a
    /// concurrency conflict from another process is resolved by re-reading
    /// and reprocessing, bounded by `max_save_attempts`.
    #[tracing::instrument(skip(self, message), fields(event_type = %message.message_type))]
    pub async fn handle(&self, message: Message) -> Result<EngineResult> {
        metrics::counter!("saga_events_handled").increment(1);

        let Some(saga_type) = self.routes.get(&message.message_type) else {
            tracing::debug!(event_type = %message.message_type, "no saga reacts to event type");
            metrics::counter!("saga_events_unroutable").increment(1);
            return Ok(EngineResult::Ignored(Disposition::UnknownEventType));
        };
        let definition = Arc::clone(&self.definitions[saga_type]);

        let Some(correlation_id) = definition.resolve_correlation(&message) else {
            tracing::warn!(event_type = %message.message_type, "event carries no correlation id");
            metrics::counter!("saga_events_unroutable").increment(1);
            return Ok(EngineResult::Ignored(Disposition::MissingCorrelation));
        };

        let lock = self.instance_lock(correlation_id).await;
        let result = {
            let _guard = lock.lock().await;
            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.apply(&definition, correlation_id, &message).await {
                    Err(EngineError::Store(e))
                        if e.is_concurrency_conflict()
                            && attempt < self.config.max_save_attempts =>
                    {
                        tracing::debug!(%correlation_id, attempt, "save conflict, reprocessing");
                        metrics::counter!("saga_save_conflicts").increment(1);
                    }
                    other => break other,
                }
            }
        };
        drop(lock);
        self.release_instance_lock(correlation_id).await;
        result
    }

    async fn apply(
        &self,
        definition: &SagaDefinition,
        correlation_id: CorrelationId,
        message: &Message,
    ) -> Result<EngineResult> {
        let (mut record, expected_version) = match self.store.load(correlation_id).await? {
            Some(loaded) => loaded,
            None => {
                if !definition.is_create_trigger(&message.message_type) {
                    tracing::debug!(
                        %correlation_id,
                        event_type = %message.message_type,
                        "no instance and event cannot create one"
                    );
                    metrics::counter!("saga_events_unroutable").increment(1);
                    return Ok(EngineResult::Ignored(Disposition::NotCreatable));
                }
                let record = SagaRecord::new(
                    correlation_id,
                    definition.saga_type(),
                    definition.initial_state(),
                );
                (record, Version::initial())
            }
        };

        if record.completed {
            // Late events after finalization are dropped silently at debug
            // level; re-triggering side effects here would break
            // exactly-once semantics.
            tracing::debug!(
                %correlation_id,
                event_type = %message.message_type,
                "instance already finalized"
            );
            return Ok(EngineResult::Ignored(Disposition::AlreadyFinalized));
        }

        let from_state = record.current_state.clone();
        let Some(spec) = definition.transition(&from_state, &message.message_type) else {
            tracing::debug!(
                %correlation_id,
                state = %from_state,
                event_type = %message.message_type,
                "no transition defined"
            );
            return Ok(EngineResult::Ignored(Disposition::UndefinedTransition));
        };

        let effects = spec.effects(&record, message);
        record.current_state = spec.target_state().to_string();

        let mut outbox = Outbox::new();
        for effect in effects {
            match effect {
                Effect::Send {
                    destination,
                    mut message,
                } => {
                    message.correlation_id.get_or_insert(correlation_id);
                    outbox.send(destination, message);
                }
                Effect::Schedule {
                    name,
                    message,
                    delay,
                } => {
                    let token = ScheduleToken::new();
                    record.scheduled_tokens.insert(name.clone(), token);
                    outbox.schedule(ScheduledMessage {
                        correlation_id,
                        schedule_name: name,
                        token,
                        due_at: Utc::now()
                            + ChronoDuration::milliseconds(delay.as_millis() as i64),
                        message_type: message.message_type,
                        payload: message.payload,
                    });
                }
                Effect::Unschedule { name } => {
                    // The token may already be gone if the schedule fired;
                    // unscheduling then is a harmless no-op.
                    if record.scheduled_tokens.remove(&name).is_some() {
                        outbox.unschedule(correlation_id, name);
                    }
                }
                Effect::Finalize => {
                    record.completed = true;
                }
            }
        }

        // An expiry delivery consumed by this transition clears its own
        // token; the schedule row was already removed at fire time.
        if let Some(schedule_name) = &message.schedule_name {
            record.scheduled_tokens.remove(schedule_name);
        }

        if definition.is_completed_state(&record.current_state) {
            record.completed = true;
        }

        let to_state = record.current_state.clone();
        let finalized = record.completed;
        let saga_type = record.saga_type.clone();
        let created = expected_version == Version::initial();

        let version = self
            .store
            .save(record, expected_version, outbox.schedule_ops())
            .await?;

        // Only a committed transition dispatches its effects.
        outbox.flush(self.bus.as_ref(), &self.scheduler).await?;

        if created {
            metrics::counter!("saga_instances_created").increment(1);
        }
        metrics::counter!("saga_transitions_committed").increment(1);
        tracing::info!(
            %correlation_id,
            saga_type = %saga_type,
            from = %from_state,
            to = %to_state,
            finalized,
            "transition committed"
        );

        Ok(EngineResult::Applied {
            correlation_id,
            saga_type,
            from_state,
            to_state,
            finalized,
            version,
        })
    }

    /// Returns the number of live per-instance locks. Entries exist only
    /// while a handler holds or waits on them.
    pub async fn instance_lock_count(&self) -> usize {
        self.locks.lock().await.len()
    }

    async fn instance_lock(&self, correlation_id: CorrelationId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(correlation_id).or_default())
    }

    /// Drops the map entry once no handler holds a clone of it anymore,
    /// keeping the lock map bounded by in-flight work rather than by every
    /// correlation id ever seen.
    async fn release_instance_lock(&self, correlation_id: CorrelationId) {
        let mut locks = self.locks.lock().await;
        if let Some(entry) = locks.get(&correlation_id)
            && Arc::strong_count(entry) == 1
        {
            locks.remove(&correlation_id);
        }
    }
}
