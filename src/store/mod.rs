//! Storage contract shared by the Postgres and in-memory backends.
//!
//! The engine talks to one trait. Two obligations carry all of the
//! concurrency weight:
//!
//! - [`StateStore::commit`] must refuse a history record whose sequence
//!   number is already taken for its key (`SequenceConflict`), and must
//!   land the record and its outbox jobs in one atomic unit.
//! - Everything else is read-mostly and safe to serve from replicas or
//!   caches; definitions change far less often than transitions.
//!
//! No implementation may take a global lock across keys: transitions on
//! different keys proceed independently.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{
    EntityKey, HistoryQuery, HistoryRecord, MachineDefinition, MachineId, NewHistoryRecord,
    NewMachine, NewState, NewTransition, NewTrigger, StateDefinition, StateId,
    TransitionDefinition, Trigger, TriggerAction, TriggerId,
};

pub use memory::MemoryStore;

// ---------------------------------------------------------------------------
// Outbox jobs
// ---------------------------------------------------------------------------

/// The work order placed on the outbox for one trigger firing.
///
/// Carries everything a handler needs so execution never reads definitions
/// back — the definitions may have changed by the time the job runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerJobPayload {
    pub trigger_id: TriggerId,
    pub action: TriggerAction,
    pub state_id: StateId,
    pub entity_type: String,
    pub entity_id: String,
    pub machine_id: MachineId,
    pub event_name: String,
    pub context: serde_json::Value,
    pub triggered_by: String,
}

/// A claimed outbox job. Invisible to other workers until the visibility
/// timeout lapses or the claimer retires, delays, or buries it.
#[derive(Debug, Clone)]
pub struct TriggerJob {
    pub job_id: i64,
    /// Delivery count including this one. Drives backoff and dead-lettering.
    pub attempts: u32,
    pub payload: TriggerJobPayload,
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StateStore: Send + Sync {
    // -- definitions --------------------------------------------------------

    async fn create_machine(&self, new: NewMachine) -> Result<MachineDefinition>;

    async fn create_state(&self, machine_id: MachineId, new: NewState) -> Result<StateDefinition>;

    async fn create_transition(&self, new: NewTransition) -> Result<TransitionDefinition>;

    async fn create_trigger(&self, state_id: StateId, new: NewTrigger) -> Result<Trigger>;

    /// Delete a state plus every transition and trigger referencing it, as
    /// one atomic unit. Fails with `StateInUse` once history references the
    /// state; live definitions are soft-disabled instead.
    async fn delete_state(&self, state_id: StateId) -> Result<()>;

    async fn set_machine_active(&self, machine_id: MachineId, active: bool) -> Result<()>;

    /// Soft-disable or re-enable a state. Deactivating the sole active
    /// initial state of a machine is rejected.
    async fn set_state_active(&self, state_id: StateId, active: bool) -> Result<()>;

    async fn machine(&self, id: MachineId) -> Result<MachineDefinition>;

    async fn machine_by_code(&self, entity_type: &str, code: &str) -> Result<MachineDefinition>;

    async fn list_machines(&self) -> Result<Vec<MachineDefinition>>;

    async fn state(&self, id: StateId) -> Result<StateDefinition>;

    async fn states_of(&self, machine_id: MachineId) -> Result<Vec<StateDefinition>>;

    async fn transitions_of(&self, machine_id: MachineId) -> Result<Vec<TransitionDefinition>>;

    /// Active initial states of a machine. The engine decides whether zero
    /// or many is fatal; the store just reports what is defined.
    async fn initial_states(&self, machine_id: MachineId) -> Result<Vec<StateDefinition>>;

    /// Active transitions leaving `from_state` on `event`, ordered by
    /// priority then creation order.
    async fn candidate_transitions(
        &self,
        from_state: StateId,
        event: &str,
    ) -> Result<Vec<TransitionDefinition>>;

    async fn triggers_of(&self, state_id: StateId) -> Result<Vec<Trigger>>;

    // -- history ------------------------------------------------------------

    /// The key's highest-sequence record, or None for an uninitialized key.
    async fn last_record(&self, key: &EntityKey) -> Result<Option<HistoryRecord>>;

    /// Compare-and-append: commit the record and enqueue its outbox jobs
    /// atomically. Fails with `SequenceConflict` when the claimed sequence
    /// number is already committed for the key.
    async fn commit(
        &self,
        record: NewHistoryRecord,
        jobs: Vec<TriggerJobPayload>,
    ) -> Result<HistoryRecord>;

    async fn history(&self, key: &EntityKey, query: &HistoryQuery) -> Result<Vec<HistoryRecord>>;

    /// The record previously committed with this idempotency token, if any.
    async fn record_by_token(&self, key: &EntityKey, token: &str)
    -> Result<Option<HistoryRecord>>;

    // -- trigger outbox -----------------------------------------------------

    /// Claim the next due job, hiding it from other workers for
    /// `visibility`. None when the outbox is drained.
    async fn claim_job(&self, visibility: Duration) -> Result<Option<TriggerJob>>;

    /// Retire a job that ran to completion.
    async fn retire_job(&self, job: &TriggerJob) -> Result<()>;

    /// Push a failed job's next delivery out by `delay`.
    async fn delay_job(&self, job: &TriggerJob, delay: Duration) -> Result<()>;

    /// Record a permanently failing job and remove it from delivery. The
    /// committed transition it belongs to is untouched.
    async fn bury_job(&self, job: &TriggerJob, reason: &str) -> Result<()>;
}
