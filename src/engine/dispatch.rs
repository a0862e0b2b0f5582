//! Trigger dispatch: the outbox worker.
//!
//! Jobs land on the outbox inside the history commit; this worker claims
//! them afterwards and runs the handler registered for the action kind.
//! Delivery is at-least-once — handlers must be idempotent — and a failing
//! job backs off exponentially until `max_attempts`, then is buried. A
//! buried job is recorded and dropped; the transition it belonged to was
//! durable before the job was ever claimed and stays that way.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::{StateStore, TriggerJob, TriggerJobPayload};
use crate::telemetry::metrics;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Executes one kind of trigger action.
///
/// Handlers run after the transition is durable and must tolerate seeing
/// the same job twice.
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn execute(&self, job: &TriggerJobPayload) -> Result<()>;
}

/// Registry of handlers, indexed by action kind.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TriggerHandler>>,
}

impl HandlerRegistry {
    /// An empty registry with no handlers.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// A registry with the built-in handlers ("audit_log").
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("audit_log", Arc::new(AuditLogHandler));
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn TriggerHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn TriggerHandler>> {
        self.handlers.get(kind)
    }
}

/// Built-in handler for `TriggerAction::AuditLog`: a structured tracing
/// line is the whole side effect, so it is naturally idempotent.
pub struct AuditLogHandler;

#[async_trait]
impl TriggerHandler for AuditLogHandler {
    async fn execute(&self, job: &TriggerJobPayload) -> Result<()> {
        let message = match &job.action {
            crate::model::TriggerAction::AuditLog { message } => message.as_deref().unwrap_or(""),
            _ => "",
        };
        info!(
            entity_type = %job.entity_type,
            entity_id = %job.entity_id,
            machine_id = %job.machine_id,
            state_id = %job.state_id,
            event = %job.event_name,
            triggered_by = %job.triggered_by,
            message,
            "audit"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Configuration for the dispatch worker.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long a claimed job stays hidden from other workers.
    pub visibility_timeout: Duration,
    /// Poll interval when the outbox is drained.
    pub poll_interval: Duration,
    /// Deliveries before a failing job is buried.
    pub max_attempts: u32,
    /// Base of the exponential retry backoff.
    pub retry_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            max_attempts: 5,
            retry_backoff: Duration::from_secs(2),
        }
    }
}

impl DispatcherConfig {
    /// Backoff before the next delivery, doubling per attempt and capped
    /// at 15 minutes.
    fn backoff_for(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.saturating_sub(1)).min(512);
        (self.retry_backoff * factor).min(Duration::from_secs(900))
    }
}

/// The dispatch worker loop over a store backend.
pub struct TriggerDispatcher<S> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    config: DispatcherConfig,
    shutdown: Arc<Notify>,
}

impl<S: StateStore> TriggerDispatcher<S> {
    pub fn new(store: Arc<S>, registry: Arc<HandlerRegistry>, config: DispatcherConfig) -> Self {
        Self {
            store,
            registry,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle used to stop the worker from another task.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Run the worker loop until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!("trigger dispatcher started");
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("trigger dispatcher shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            if let Err(e) = self.run_pending().await {
                warn!("dispatch error: {e}");
            }
        }
    }

    /// Claim and process jobs until the outbox has nothing due. Returns
    /// how many deliveries were attempted.
    pub async fn run_pending(&self) -> Result<usize> {
        let mut attempted = 0;
        while let Some(job) = self.store.claim_job(self.config.visibility_timeout).await? {
            attempted += 1;
            self.process(job).await?;
        }
        Ok(attempted)
    }

    async fn process(&self, job: TriggerJob) -> Result<()> {
        let kind = job.payload.action.kind();

        let Some(handler) = self.registry.get(kind) else {
            // Nothing will ever handle it; retrying cannot help.
            self.store
                .bury_job(&job, &format!("no handler registered for {kind:?}"))
                .await?;
            metrics::trigger_executions().add(
                1,
                &[
                    KeyValue::new("action", kind),
                    KeyValue::new("result", "unroutable"),
                ],
            );
            return Ok(());
        };

        match handler.execute(&job.payload).await {
            Ok(()) => {
                debug!(
                    trigger_id = %job.payload.trigger_id,
                    action = kind,
                    attempts = job.attempts,
                    "trigger executed"
                );
                self.store.retire_job(&job).await?;
                metrics::trigger_executions().add(
                    1,
                    &[KeyValue::new("action", kind), KeyValue::new("result", "ok")],
                );
            }
            Err(e) if job.attempts >= self.config.max_attempts => {
                self.store
                    .bury_job(&job, &format!("failed after {} attempts: {e}", job.attempts))
                    .await?;
                metrics::trigger_executions().add(
                    1,
                    &[
                        KeyValue::new("action", kind),
                        KeyValue::new("result", "dead"),
                    ],
                );
            }
            Err(e) => {
                let delay = self.config.backoff_for(job.attempts);
                warn!(
                    trigger_id = %job.payload.trigger_id,
                    action = kind,
                    attempts = job.attempts,
                    delay_s = delay.as_secs(),
                    "trigger failed, will retry: {e}"
                );
                self.store.delay_job(&job, delay).await?;
                metrics::trigger_executions().add(
                    1,
                    &[
                        KeyValue::new("action", kind),
                        KeyValue::new("result", "retry"),
                    ],
                );
            }
        }
        Ok(())
    }
}
