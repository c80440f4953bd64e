//! End-to-end engine behaviour over the in-memory store and bus, driven by
//! an inventory allocation saga: a created allocation schedules a hold
//! expiry, a release cancels it, and an expired hold releases the stock.

use std::sync::Arc;
use std::time::Duration;

use bus::{InMemoryBus, Message, MessageBus};
use chrono::Utc;
use common::{CorrelationId, ScheduleToken};
use engine::{Disposition, Effect, EngineResult, SagaDefinition, SagaEngine};
use futures_util::future::join_all;
use store::{InMemorySagaStore, SagaRecord, SagaStore, ScheduleOp, ScheduledMessage, Version};

const HOLD: &str = "HoldExpiration";

fn extract_allocation_id(message: &Message) -> Option<CorrelationId> {
    message
        .payload
        .get("allocation_id")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

fn arm_hold(message: &Message) -> Effect {
    let hold_ms = message
        .payload
        .get("hold_duration_ms")
        .and_then(|v| v.as_u64())
        .unwrap_or(60_000);
    Effect::Schedule {
        name: HOLD.to_string(),
        message: Message::from_value("HoldExpired", message.payload.clone()),
        delay: Duration::from_millis(hold_ms),
    }
}

fn allocation_saga() -> SagaDefinition {
    SagaDefinition::builder("Allocation")
        .initial_state("Initial")
        .state("Allocated")
        .state("Released")
        .completed_state("Released")
        .create_on("AllocationCreated")
        .correlate("AllocationCreated", extract_allocation_id)
        .correlate("ReleaseRequested", extract_allocation_id)
        .correlate("AllocationFaulted", extract_allocation_id)
        .transition("Initial", "AllocationCreated", "Allocated", |_, m| {
            vec![
                arm_hold(m),
                Effect::Send {
                    destination: "fulfill-order".to_string(),
                    message: Message::from_value("FulfillOrder", m.payload.clone()),
                },
            ]
        })
        // A duplicate create on an allocated instance only refreshes the
        // hold; fulfilment was already requested.
        .transition("Allocated", "AllocationCreated", "Allocated", |_, m| {
            vec![arm_hold(m)]
        })
        .transition("Allocated", "HoldExpired", "Released", |_, m| {
            vec![Effect::Send {
                destination: "release-inventory".to_string(),
                message: Message::from_value("ReleaseInventory", m.payload.clone()),
            }]
        })
        .transition("Allocated", "ReleaseRequested", "Released", |_, _| {
            vec![Effect::Unschedule {
                name: HOLD.to_string(),
            }]
        })
        // A fault before allocation abandons the instance outright.
        .transition("Initial", "AllocationFaulted", "Released", |_, _| Vec::new())
        .build()
        .unwrap()
}

fn engine_over(
    store: InMemorySagaStore,
    bus: InMemoryBus,
) -> Arc<SagaEngine<InMemorySagaStore, InMemoryBus>> {
    let mut engine = SagaEngine::new(store, bus);
    engine.register(allocation_saga()).unwrap();
    Arc::new(engine)
}

fn created(id: CorrelationId, hold_ms: u64) -> Message {
    Message::from_value(
        "AllocationCreated",
        serde_json::json!({ "allocation_id": id, "hold_duration_ms": hold_ms }),
    )
}

fn release(id: CorrelationId) -> Message {
    Message::from_value("ReleaseRequested", serde_json::json!({ "allocation_id": id }))
}

#[tokio::test]
async fn creating_an_allocation_schedules_hold_and_requests_fulfillment() {
    let store = InMemorySagaStore::new();
    let bus = InMemoryBus::new();
    let engine = engine_over(store.clone(), bus.clone());
    let id = CorrelationId::new();

    let result = engine.handle(created(id, 60_000)).await.unwrap();
    match result {
        EngineResult::Applied {
            correlation_id,
            to_state,
            finalized,
            ..
        } => {
            assert_eq!(correlation_id, id);
            assert_eq!(to_state, "Allocated");
            assert!(!finalized);
        }
        other => panic!("expected applied transition, got {other:?}"),
    }

    let sent = bus.sent_to("fulfill-order").await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].correlation_id, Some(id));

    let pending = store.pending_schedules().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].schedule_name, HOLD);
    assert_eq!(pending[0].correlation_id, id);

    let (record, version) = store.load(id).await.unwrap().unwrap();
    assert!(record.scheduled_tokens.contains_key(HOLD));
    assert_eq!(version, Version::first());
}

#[tokio::test(start_paused = true)]
async fn hold_expiry_releases_the_allocation() {
    let store = InMemorySagaStore::new();
    let bus = InMemoryBus::new();
    let engine = engine_over(store.clone(), bus.clone());
    let id = CorrelationId::new();

    let mut expirations = bus.subscribe("HoldExpired").await.unwrap();
    engine.handle(created(id, 1_000)).await.unwrap();

    tokio::time::advance(Duration::from_millis(1_001)).await;
    tokio::task::yield_now().await;

    let expiry = expirations.recv().await.unwrap();
    assert_eq!(expiry.correlation_id, Some(id));
    assert_eq!(expiry.schedule_name.as_deref(), Some(HOLD));

    let result = engine.handle(expiry).await.unwrap();
    assert!(matches!(
        result,
        EngineResult::Applied { ref to_state, finalized: true, .. } if to_state == "Released"
    ));

    let (record, _) = store.load(id).await.unwrap().unwrap();
    assert!(record.completed);
    assert!(record.scheduled_tokens.is_empty());
    assert_eq!(store.schedule_count().await, 0);
    assert_eq!(bus.sent_to("release-inventory").await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn releasing_cancels_the_hold_timer() {
    let store = InMemorySagaStore::new();
    let bus = InMemoryBus::new();
    let engine = engine_over(store.clone(), bus.clone());
    let id = CorrelationId::new();

    engine.handle(created(id, 60_000)).await.unwrap();
    let result = engine.handle(release(id)).await.unwrap();
    assert!(matches!(
        result,
        EngineResult::Applied { finalized: true, .. }
    ));
    assert_eq!(store.schedule_count().await, 0);

    tokio::time::advance(Duration::from_secs(120)).await;
    tokio::task::yield_now().await;
    assert!(bus.published_of_type("HoldExpired").await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn duplicate_create_refreshes_the_hold() {
    let store = InMemorySagaStore::new();
    let bus = InMemoryBus::new();
    let engine = engine_over(store.clone(), bus.clone());
    let id = CorrelationId::new();

    engine.handle(created(id, 60_000)).await.unwrap();
    engine.handle(created(id, 120_000)).await.unwrap();

    assert_eq!(store.schedule_count().await, 1);
    assert_eq!(bus.sent_to("fulfill-order").await.len(), 1);

    // The first hold's due time passes without a delivery.
    tokio::time::advance(Duration::from_secs(70)).await;
    tokio::task::yield_now().await;
    assert!(bus.published_of_type("HoldExpired").await.is_empty());

    tokio::time::advance(Duration::from_secs(60)).await;
    tokio::task::yield_now().await;
    assert_eq!(bus.published_of_type("HoldExpired").await.len(), 1);
}

#[tokio::test]
async fn events_after_finalization_are_dropped() {
    let store = InMemorySagaStore::new();
    let bus = InMemoryBus::new();
    let engine = engine_over(store.clone(), bus.clone());
    let id = CorrelationId::new();

    engine.handle(created(id, 60_000)).await.unwrap();
    engine.handle(release(id)).await.unwrap();

    let result = engine.handle(created(id, 60_000)).await.unwrap();
    assert!(matches!(
        result,
        EngineResult::Ignored(Disposition::AlreadyFinalized)
    ));

    // A hold expiry that lost the race with the release is equally inert.
    let stray = Message::from_value("HoldExpired", serde_json::json!({ "allocation_id": id }))
        .correlated(id)
        .via_schedule(HOLD);
    let result = engine.handle(stray).await.unwrap();
    assert!(matches!(
        result,
        EngineResult::Ignored(Disposition::AlreadyFinalized)
    ));

    assert_eq!(bus.sent_to("fulfill-order").await.len(), 1);
    assert!(bus.sent_to("release-inventory").await.is_empty());
}

#[tokio::test]
async fn unroutable_events_leave_no_trace() {
    let store = InMemorySagaStore::new();
    let bus = InMemoryBus::new();
    let engine = engine_over(store.clone(), bus.clone());

    let result = engine
        .handle(Message::from_value("PriceUpdated", serde_json::json!({})))
        .await
        .unwrap();
    assert!(matches!(
        result,
        EngineResult::Ignored(Disposition::UnknownEventType)
    ));

    let result = engine
        .handle(Message::from_value(
            "ReleaseRequested",
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert!(matches!(
        result,
        EngineResult::Ignored(Disposition::MissingCorrelation)
    ));

    let result = engine.handle(release(CorrelationId::new())).await.unwrap();
    assert!(matches!(
        result,
        EngineResult::Ignored(Disposition::NotCreatable)
    ));

    assert_eq!(store.instance_count().await, 0);
    assert!(bus.published().await.is_empty());
}

#[tokio::test]
async fn undefined_transition_leaves_state_and_version_unchanged() {
    let store = InMemorySagaStore::new();
    let bus = InMemoryBus::new();
    let engine = engine_over(store.clone(), bus.clone());
    let id = CorrelationId::new();

    engine.handle(created(id, 60_000)).await.unwrap();
    let (before, version_before) = store.load(id).await.unwrap().unwrap();

    // AllocationFaulted is routed to the saga but has no transition out of
    // the Allocated state.
    let result = engine
        .handle(Message::from_value(
            "AllocationFaulted",
            serde_json::json!({ "allocation_id": id }),
        ))
        .await
        .unwrap();
    assert!(matches!(
        result,
        EngineResult::Ignored(Disposition::UndefinedTransition)
    ));

    let (after, version_after) = store.load(id).await.unwrap().unwrap();
    assert_eq!(after.current_state, before.current_state);
    assert_eq!(version_after, version_before);
    assert_eq!(store.schedule_count().await, 1);
}

#[tokio::test]
async fn distinct_correlation_ids_proceed_in_parallel() {
    let store = InMemorySagaStore::new();
    let bus = InMemoryBus::new();
    let engine = engine_over(store.clone(), bus.clone());

    let handles = (0..20).map(|_| {
        let engine = Arc::clone(&engine);
        async move { engine.handle(created(CorrelationId::new(), 60_000)).await }
    });
    for result in join_all(handles).await {
        assert!(result.unwrap().is_applied());
    }

    assert_eq!(store.instance_count().await, 20);
    assert_eq!(bus.sent_to("fulfill-order").await.len(), 20);

    // Per-instance locks exist only while a handler is in flight; a
    // long-lived engine must not accumulate one per id ever seen.
    assert_eq!(engine.instance_lock_count().await, 0);
}

#[tokio::test]
async fn conflicting_writers_both_commit_through_reprocessing() {
    let store = InMemorySagaStore::new();
    let bus = InMemoryBus::new();
    let engine_a = engine_over(store.clone(), bus.clone());
    let engine_b = engine_over(store.clone(), bus.clone());
    let id = CorrelationId::new();

    engine_a.handle(created(id, 60_000)).await.unwrap();

    // Two processes racing on the same instance; the loser re-reads the
    // fresh version and reprocesses.
    let (a, b) = tokio::join!(
        engine_a.handle(created(id, 30_000)),
        engine_b.handle(created(id, 45_000)),
    );
    assert!(a.unwrap().is_applied());
    assert!(b.unwrap().is_applied());

    let (_, version) = store.load(id).await.unwrap().unwrap();
    assert_eq!(version, Version::new(3));
    assert_eq!(store.schedule_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn restart_restores_timers_from_persisted_schedules() {
    let store = InMemorySagaStore::new();
    let bus = InMemoryBus::new();
    let id = CorrelationId::new();

    // A hold committed by a previous process: the instance and its
    // schedule row exist, but no timer is live.
    let mut record = SagaRecord::new(id, "Allocation", "Allocated");
    let token = ScheduleToken::new();
    record.scheduled_tokens.insert(HOLD.to_string(), token);
    store
        .save(
            record,
            Version::initial(),
            vec![ScheduleOp::Insert(ScheduledMessage {
                correlation_id: id,
                schedule_name: HOLD.to_string(),
                token,
                due_at: Utc::now() + chrono::Duration::seconds(60),
                message_type: "HoldExpired".to_string(),
                payload: serde_json::json!({ "allocation_id": id }),
            })],
        )
        .await
        .unwrap();

    let engine = engine_over(store.clone(), bus.clone());
    let mut expirations = bus.subscribe("HoldExpired").await.unwrap();
    engine.restore_schedules().await.unwrap();

    tokio::time::advance(Duration::from_secs(61)).await;
    tokio::task::yield_now().await;

    let expiry = expirations.recv().await.unwrap();
    let result = engine.handle(expiry).await.unwrap();
    assert!(result.is_applied());

    let (record, _) = store.load(id).await.unwrap().unwrap();
    assert!(record.completed);
    assert!(record.scheduled_tokens.is_empty());
}
