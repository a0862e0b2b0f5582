//! Integration tests for the trigger outbox and dispatch worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use trellis_rs::engine::{
    DispatcherConfig, HandlerRegistry, TransitionEngine, TransitionRequest, TriggerDispatcher,
    TriggerHandler,
};
use trellis_rs::error::{Error, Result};
use trellis_rs::model::*;
use trellis_rs::store::{MemoryStore, StateStore, TriggerJobPayload};

/// One-edge machine whose target state carries the given trigger action.
async fn machine_with_trigger(
    store: &MemoryStore,
    action: TriggerAction,
) -> (MachineId, StateId) {
    let machine = store
        .create_machine(NewMachine::new("shipment", "delivery"))
        .await
        .unwrap();
    let pending = store
        .create_state(machine.id, NewState::new("pending").initial())
        .await
        .unwrap();
    let shipped = store
        .create_state(machine.id, NewState::new("shipped").r#final())
        .await
        .unwrap();
    store
        .create_transition(NewTransition::new(pending.id, shipped.id, "ship"))
        .await
        .unwrap();
    store
        .create_trigger(shipped.id, NewTrigger::new(action))
        .await
        .unwrap();
    (machine.id, shipped.id)
}

/// Dispatcher tuned for tests: everything immediate, few attempts.
fn test_config(max_attempts: u32) -> DispatcherConfig {
    DispatcherConfig {
        visibility_timeout: Duration::ZERO,
        poll_interval: Duration::from_millis(10),
        max_attempts,
        retry_backoff: Duration::ZERO,
    }
}

/// Handler that succeeds after failing a set number of times.
struct FlakyHandler {
    failures_left: AtomicU32,
    executions: AtomicU32,
}

impl FlakyHandler {
    fn failing_first(n: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(n),
            executions: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TriggerHandler for FlakyHandler {
    async fn execute(&self, _job: &TriggerJobPayload) -> Result<()> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(Error::Other("downstream unavailable".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Enqueue-on-commit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn entering_a_state_with_a_trigger_enqueues_one_job() {
    let store = Arc::new(MemoryStore::new());
    let (machine_id, _) =
        machine_with_trigger(&store, TriggerAction::AuditLog { message: None }).await;
    let engine = TransitionEngine::new(Arc::clone(&store));

    engine.initialize("shipment", "s1", machine_id, "test").await.unwrap();
    assert_eq!(store.outbox_len(), 0, "pending has no trigger");

    engine
        .transition(TransitionRequest::new("shipment", "s1", machine_id, "ship"))
        .await
        .unwrap();
    assert_eq!(store.outbox_len(), 1);
}

#[tokio::test]
async fn rejected_transitions_enqueue_nothing() {
    let store = Arc::new(MemoryStore::new());
    let (machine_id, _) =
        machine_with_trigger(&store, TriggerAction::AuditLog { message: None }).await;
    let engine = TransitionEngine::new(Arc::clone(&store));

    engine.initialize("shipment", "s1", machine_id, "test").await.unwrap();
    let err = engine
        .transition(TransitionRequest::new("shipment", "s1", machine_id, "refund"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransitionNotAllowed { .. }));
    assert_eq!(store.outbox_len(), 0);
}

// ---------------------------------------------------------------------------
// Execution, retry, dead-letter
// ---------------------------------------------------------------------------

#[tokio::test]
async fn builtin_audit_log_handler_retires_the_job() {
    let store = Arc::new(MemoryStore::new());
    let (machine_id, _) = machine_with_trigger(
        &store,
        TriggerAction::AuditLog {
            message: Some("shipment left the warehouse".into()),
        },
    )
    .await;
    let engine = TransitionEngine::new(Arc::clone(&store));
    engine.initialize("shipment", "s1", machine_id, "test").await.unwrap();
    engine
        .transition(TransitionRequest::new("shipment", "s1", machine_id, "ship"))
        .await
        .unwrap();

    let dispatcher = TriggerDispatcher::new(
        Arc::clone(&store),
        Arc::new(HandlerRegistry::with_builtins()),
        test_config(3),
    );
    let attempted = dispatcher.run_pending().await.unwrap();
    assert_eq!(attempted, 1);
    assert_eq!(store.outbox_len(), 0);
    assert!(store.dead_letters().is_empty());
}

#[tokio::test]
async fn failing_handler_is_retried_then_succeeds() {
    let store = Arc::new(MemoryStore::new());
    let (machine_id, _) = machine_with_trigger(
        &store,
        TriggerAction::Webhook {
            url: "https://example.test/hooks/shipments".into(),
        },
    )
    .await;
    let engine = TransitionEngine::new(Arc::clone(&store));
    engine.initialize("shipment", "s1", machine_id, "test").await.unwrap();
    engine
        .transition(TransitionRequest::new("shipment", "s1", machine_id, "ship"))
        .await
        .unwrap();

    let handler = Arc::new(FlakyHandler::failing_first(2));
    let mut registry = HandlerRegistry::empty();
    registry.register("webhook", Arc::clone(&handler) as Arc<dyn TriggerHandler>);

    let dispatcher =
        TriggerDispatcher::new(Arc::clone(&store), Arc::new(registry), test_config(5));
    dispatcher.run_pending().await.unwrap();

    // Two failed deliveries, one success — at-least-once, then retired.
    assert_eq!(handler.executions.load(Ordering::SeqCst), 3);
    assert_eq!(store.outbox_len(), 0);
    assert!(store.dead_letters().is_empty());
}

#[tokio::test]
async fn permanently_failing_handler_is_buried_after_max_attempts() {
    let store = Arc::new(MemoryStore::new());
    let (machine_id, shipped) = machine_with_trigger(
        &store,
        TriggerAction::Webhook {
            url: "https://example.test/hooks/shipments".into(),
        },
    )
    .await;
    let engine = TransitionEngine::new(Arc::clone(&store));
    engine.initialize("shipment", "s1", machine_id, "test").await.unwrap();
    engine
        .transition(TransitionRequest::new("shipment", "s1", machine_id, "ship"))
        .await
        .unwrap();

    let handler = Arc::new(FlakyHandler::failing_first(u32::MAX));
    let mut registry = HandlerRegistry::empty();
    registry.register("webhook", Arc::clone(&handler) as Arc<dyn TriggerHandler>);

    let dispatcher =
        TriggerDispatcher::new(Arc::clone(&store), Arc::new(registry), test_config(3));
    dispatcher.run_pending().await.unwrap();

    assert_eq!(handler.executions.load(Ordering::SeqCst), 3);
    let dead = store.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].0.state_id, shipped);

    // The committed transition is untouched by the dead trigger.
    let key = EntityKey::new("shipment", "s1", machine_id);
    let current = store.last_record(&key).await.unwrap().unwrap();
    assert_eq!(current.state_id, shipped);
    assert_eq!(current.sequence_no, 2);
}

#[tokio::test]
async fn job_with_no_registered_handler_is_buried_not_retried() {
    let store = Arc::new(MemoryStore::new());
    let (machine_id, _) = machine_with_trigger(
        &store,
        TriggerAction::Notify {
            channel: "#logistics".into(),
            template: "shipment_shipped".into(),
        },
    )
    .await;
    let engine = TransitionEngine::new(Arc::clone(&store));
    engine.initialize("shipment", "s1", machine_id, "test").await.unwrap();
    engine
        .transition(TransitionRequest::new("shipment", "s1", machine_id, "ship"))
        .await
        .unwrap();

    let dispatcher = TriggerDispatcher::new(
        Arc::clone(&store),
        Arc::new(HandlerRegistry::with_builtins()),
        test_config(3),
    );
    dispatcher.run_pending().await.unwrap();

    let dead = store.dead_letters();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].1.contains("no handler"));
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_loop_processes_jobs_and_stops_on_shutdown() {
    let store = Arc::new(MemoryStore::new());
    let (machine_id, _) =
        machine_with_trigger(&store, TriggerAction::AuditLog { message: None }).await;
    let engine = TransitionEngine::new(Arc::clone(&store));
    engine.initialize("shipment", "s1", machine_id, "test").await.unwrap();
    engine
        .transition(TransitionRequest::new("shipment", "s1", machine_id, "ship"))
        .await
        .unwrap();

    let dispatcher = TriggerDispatcher::new(
        Arc::clone(&store),
        Arc::new(HandlerRegistry::with_builtins()),
        test_config(3),
    );
    let shutdown = dispatcher.shutdown_handle();

    let worker = tokio::spawn(async move { dispatcher.run().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.notify_one();
    worker.await.unwrap().unwrap();

    assert_eq!(store.outbox_len(), 0);
}
