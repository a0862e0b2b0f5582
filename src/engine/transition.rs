//! The transition algorithm.
//!
//! One call, one short unit of work: resolve current state from the history
//! log, validate the requested event against the definitions, commit the
//! next record with a compare-and-append, and leave side effects on the
//! outbox. All commits for a key are serialized by the sequence number; the
//! engine never takes a lock of its own and never auto-retries a lost race
//! — masking a caller's double submission is worse than making it retry.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{Instrument, info};

use crate::error::{Error, Result};
use crate::model::{
    BOOTSTRAP_EVENT, EntityKey, HistoryQuery, HistoryRecord, MachineId, NewHistoryRecord,
    StateDefinition, TransitionOutcome,
};
use crate::store::{StateStore, TriggerJobPayload};
use crate::telemetry::metrics;
use crate::telemetry::span::{record_state_change, start_transition_span};

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// One lifecycle event a caller wants applied to one entity under one
/// machine.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub entity_type: String,
    pub entity_id: String,
    pub machine_id: MachineId,
    pub event_name: String,
    pub triggered_by: String,
    pub context: serde_json::Value,
    pub idempotency_token: Option<String>,
}

impl TransitionRequest {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        machine_id: MachineId,
        event_name: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            machine_id,
            event_name: event_name.into(),
            triggered_by: "system".to_string(),
            context: serde_json::Value::Null,
            idempotency_token: None,
        }
    }

    pub fn triggered_by(mut self, triggered_by: impl Into<String>) -> Self {
        self.triggered_by = triggered_by.into();
        self
    }

    pub fn context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Caller-supplied retry token. A token already committed for the key
    /// turns the call into a no-op success instead of a second transition.
    pub fn idempotency_token(mut self, token: impl Into<String>) -> Self {
        self.idempotency_token = Some(token.into());
        self
    }

    fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.entity_id, self.machine_id)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The transition engine over a store backend.
pub struct TransitionEngine<S> {
    store: Arc<S>,
}

impl<S> Clone for TransitionEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: StateStore> TransitionEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Apply a lifecycle event.
    ///
    /// On the first call for a key the entity bootstraps into its machine's
    /// initial state and the requested event is NOT consumed — the caller
    /// gets `from_state_id: None` and should fire the event again if it
    /// meant it. Compatibility behavior; [`Self::initialize`] is the
    /// explicit alternative.
    pub async fn transition(&self, request: TransitionRequest) -> Result<TransitionOutcome> {
        let span = start_transition_span(
            &request.entity_type,
            &request.entity_id,
            request.machine_id,
            &request.event_name,
        );
        self.transition_inner(request).instrument(span).await
    }

    /// Explicitly bootstrap a key into its machine's initial state.
    ///
    /// A no-op success when the key is already initialized.
    pub async fn initialize(
        &self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        machine_id: MachineId,
        triggered_by: impl Into<String>,
    ) -> Result<TransitionOutcome> {
        let request = TransitionRequest::new(entity_type, entity_id, machine_id, BOOTSTRAP_EVENT)
            .triggered_by(triggered_by);
        let machine = self.machine_checked(machine_id).await?;
        let key = request.key();

        if let Some(last) = self.store.last_record(&key).await? {
            return Ok(TransitionOutcome {
                from_state_id: last.from_state_id,
                to_state_id: last.state_id,
                record: last,
                replayed: true,
            });
        }
        let outcome = self.bootstrap(&request, &key).await;
        self.tally(&machine.code, &outcome);
        outcome
    }

    /// Current state of a key, or None for an uninitialized key.
    pub async fn current_state(&self, key: &EntityKey) -> Result<Option<StateDefinition>> {
        match self.store.last_record(key).await? {
            Some(record) => Ok(Some(self.store.state(record.state_id).await?)),
            None => Ok(None),
        }
    }

    /// A key's audit trail in sequence order.
    pub async fn history(
        &self,
        key: &EntityKey,
        query: &HistoryQuery,
    ) -> Result<Vec<HistoryRecord>> {
        self.store.history(key, query).await
    }

    async fn transition_inner(&self, request: TransitionRequest) -> Result<TransitionOutcome> {
        let machine = self.machine_checked(request.machine_id).await?;
        let key = request.key();

        // A token that already committed is a finished call replaying.
        if let Some(ref token) = request.idempotency_token
            && let Some(record) = self.store.record_by_token(&key, token).await?
        {
            let outcome = Ok(replayed_outcome(record));
            self.tally(&machine.code, &outcome);
            return outcome;
        }

        let outcome = match self.store.last_record(&key).await? {
            None => self.bootstrap(&request, &key).await,
            Some(last) => self.advance(&request, &key, last).await,
        };
        self.tally(&machine.code, &outcome);
        outcome
    }

    /// First contact with a key: append the bootstrap record. The caller's
    /// event is swallowed by design.
    async fn bootstrap(
        &self,
        request: &TransitionRequest,
        key: &EntityKey,
    ) -> Result<TransitionOutcome> {
        let initials = self.store.initial_states(request.machine_id).await?;
        let initial = match initials.len() {
            0 => {
                return Err(Error::InitialStateMissing {
                    machine_id: request.machine_id,
                });
            }
            1 => &initials[0],
            // Guessing between several initial states would make replay
            // depend on definition iteration order.
            _ => {
                return Err(Error::AmbiguousInitialState {
                    machine_id: request.machine_id,
                });
            }
        };

        let jobs = self.jobs_for(initial, request).await?;
        let record = NewHistoryRecord {
            key: key.clone(),
            state_id: initial.id,
            from_state_id: None,
            event_name: BOOTSTRAP_EVENT.to_string(),
            context: request.context.clone(),
            triggered_by: request.triggered_by.clone(),
            idempotency_token: request.idempotency_token.clone(),
            sequence_no: 1,
        };

        let (committed, replayed) = self.commit_or_resolve(record, jobs, request, key).await?;
        if replayed {
            return Ok(replayed_outcome(committed));
        }
        record_state_change(None, &initial.code);
        info!(key = %key, state = %initial.code, "entity bootstrapped");
        Ok(TransitionOutcome {
            from_state_id: None,
            to_state_id: initial.id,
            record: committed,
            replayed: false,
        })
    }

    /// The initialized path: validate the event, pick the edge, commit.
    async fn advance(
        &self,
        request: &TransitionRequest,
        key: &EntityKey,
        last: HistoryRecord,
    ) -> Result<TransitionOutcome> {
        let current = self.store.state(last.state_id).await?;
        let candidates = self
            .store
            .candidate_transitions(current.id, &request.event_name)
            .await?;
        if candidates.is_empty() {
            return Err(Error::TransitionNotAllowed {
                state: current.code.clone(),
                event: request.event_name.clone(),
            });
        }

        // First satisfied condition wins, in priority order. Unconditional
        // edges always match.
        let selected = candidates
            .iter()
            .find(|t| {
                t.condition
                    .as_ref()
                    .is_none_or(|c| c.evaluate(&request.context))
            })
            .ok_or_else(|| Error::TransitionConditionFailed {
                state: current.code.clone(),
                event: request.event_name.clone(),
            })?;

        let to_state = self.store.state(selected.to_state_id).await?;
        let jobs = self.jobs_for(&to_state, request).await?;
        let record = NewHistoryRecord {
            key: key.clone(),
            state_id: to_state.id,
            from_state_id: Some(current.id),
            event_name: request.event_name.clone(),
            context: request.context.clone(),
            triggered_by: request.triggered_by.clone(),
            idempotency_token: request.idempotency_token.clone(),
            sequence_no: last.sequence_no + 1,
        };

        let (committed, replayed) = self.commit_or_resolve(record, jobs, request, key).await?;
        if replayed {
            return Ok(replayed_outcome(committed));
        }
        record_state_change(Some(&current.code), &to_state.code);
        info!(
            key = %key,
            from = %current.code,
            to = %to_state.code,
            event = %request.event_name,
            "transition committed"
        );
        Ok(TransitionOutcome {
            from_state_id: Some(current.id),
            to_state_id: to_state.id,
            record: committed,
            replayed: false,
        })
    }

    /// Commit, resolving a lost race: losing to your own token is a replay,
    /// losing to anyone else is the caller's conflict to retry. The bool is
    /// true for the replay case.
    async fn commit_or_resolve(
        &self,
        record: NewHistoryRecord,
        jobs: Vec<TriggerJobPayload>,
        request: &TransitionRequest,
        key: &EntityKey,
    ) -> Result<(HistoryRecord, bool)> {
        match self.store.commit(record, jobs).await {
            Ok(committed) => Ok((committed, false)),
            Err(Error::SequenceConflict { .. }) => {
                if let Some(ref token) = request.idempotency_token
                    && let Some(existing) = self.store.record_by_token(key, token).await?
                {
                    return Ok((existing, true));
                }
                Err(Error::ConcurrentTransitionConflict { key: key.clone() })
            }
            Err(e) => Err(e),
        }
    }

    /// Outbox payloads for the triggers attached to the entered state.
    async fn jobs_for(
        &self,
        state: &StateDefinition,
        request: &TransitionRequest,
    ) -> Result<Vec<TriggerJobPayload>> {
        let triggers = self.store.triggers_of(state.id).await?;
        Ok(triggers
            .into_iter()
            .map(|t| TriggerJobPayload {
                trigger_id: t.id,
                action: t.action,
                state_id: state.id,
                entity_type: request.entity_type.clone(),
                entity_id: request.entity_id.clone(),
                machine_id: request.machine_id,
                event_name: request.event_name.clone(),
                context: request.context.clone(),
                triggered_by: request.triggered_by.clone(),
            })
            .collect())
    }

    async fn machine_checked(&self, machine_id: MachineId) -> Result<crate::model::MachineDefinition> {
        let machine = self.store.machine(machine_id).await?;
        if !machine.is_active {
            return Err(Error::MachineDisabled(machine_id));
        }
        Ok(machine)
    }

    fn tally(&self, machine_code: &str, outcome: &Result<TransitionOutcome>) {
        let result = match outcome {
            Ok(o) if o.replayed => "replayed",
            Ok(o) if o.from_state_id.is_none() => "bootstrap",
            Ok(_) => "committed",
            Err(Error::TransitionNotAllowed { .. }) => "not_allowed",
            Err(Error::TransitionConditionFailed { .. }) => "condition_failed",
            Err(Error::ConcurrentTransitionConflict { .. }) => "conflict",
            Err(_) => "error",
        };
        metrics::transitions().add(
            1,
            &[
                KeyValue::new("machine", machine_code.to_string()),
                KeyValue::new("result", result.to_string()),
            ],
        );
    }
}

fn replayed_outcome(record: HistoryRecord) -> TransitionOutcome {
    TransitionOutcome {
        from_state_id: record.from_state_id,
        to_state_id: record.state_id,
        record,
        replayed: true,
    }
}
