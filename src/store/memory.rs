//! In-memory store backend.
//!
//! Backs the test suite and embedded single-process use. One mutex guards
//! all state; critical sections are short and never held across an await,
//! so per-key serialization comes for free while distinct keys still
//! interleave freely at the engine level. The compare-and-append check in
//! [`MemoryStore::commit`] mirrors the uniqueness constraint the Postgres
//! backend gets from its history table.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    EntityKey, HistoryQuery, HistoryRecord, MachineDefinition, MachineId, NewHistoryRecord,
    NewMachine, NewState, NewTransition, NewTrigger, StateDefinition, StateId,
    TransitionDefinition, TransitionId, Trigger, TriggerId,
};

use super::{StateStore, TriggerJob, TriggerJobPayload};

#[derive(Default)]
struct Inner {
    machines: HashMap<MachineId, MachineDefinition>,
    states: HashMap<StateId, StateDefinition>,
    transitions: HashMap<TransitionId, TransitionDefinition>,
    triggers: HashMap<TriggerId, Trigger>,
    /// Per-key records, always sorted by sequence number.
    history: HashMap<EntityKey, Vec<HistoryRecord>>,
    outbox: Vec<QueuedJob>,
    dead: Vec<(TriggerJobPayload, String)>,
    next_job_id: i64,
}

struct QueuedJob {
    job_id: i64,
    read_ct: u32,
    visible_at: Instant,
    payload: TriggerJobPayload,
}

/// Store backend holding everything in process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs currently waiting on the outbox (visible or claimed).
    pub fn outbox_len(&self) -> usize {
        self.inner.lock().unwrap().outbox.len()
    }

    /// Permanently failed jobs, with the reason they were buried.
    pub fn dead_letters(&self) -> Vec<(TriggerJobPayload, String)> {
        self.inner.lock().unwrap().dead.clone()
    }
}

impl Inner {
    fn state(&self, id: StateId) -> Result<&StateDefinition> {
        self.states.get(&id).ok_or(Error::UnknownState(id))
    }

    fn active_initial_states(&self, machine_id: MachineId) -> Vec<&StateDefinition> {
        let mut found: Vec<&StateDefinition> = self
            .states
            .values()
            .filter(|s| s.machine_id == machine_id && s.is_initial && s.is_active)
            .collect();
        found.sort_by(|a, b| (a.created_at, a.id.0).cmp(&(b.created_at, b.id.0)));
        found
    }

    fn history_references(&self, state_id: StateId) -> bool {
        self.history.values().flatten().any(|r| {
            r.state_id == state_id || r.from_state_id == Some(state_id)
        })
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    // -- definitions --------------------------------------------------------

    async fn create_machine(&self, new: NewMachine) -> Result<MachineDefinition> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .machines
            .values()
            .any(|m| m.entity_type == new.entity_type && m.code == new.code)
        {
            return Err(Error::DuplicateMachine {
                entity_type: new.entity_type,
                code: new.code,
            });
        }
        let now = Utc::now();
        let machine = MachineDefinition {
            id: MachineId::new(),
            code: new.code,
            entity_type: new.entity_type,
            name: new.name,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        inner.machines.insert(machine.id, machine.clone());
        Ok(machine)
    }

    async fn create_state(&self, machine_id: MachineId, new: NewState) -> Result<StateDefinition> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.machines.contains_key(&machine_id) {
            return Err(Error::UnknownMachine(machine_id));
        }
        if inner
            .states
            .values()
            .any(|s| s.machine_id == machine_id && s.code == new.code)
        {
            return Err(Error::DuplicateState {
                machine_id,
                code: new.code,
            });
        }
        if new.is_initial && !inner.active_initial_states(machine_id).is_empty() {
            return Err(Error::DuplicateInitialState { machine_id });
        }
        let state = StateDefinition {
            id: StateId::new(),
            machine_id,
            code: new.code,
            name: new.name,
            is_initial: new.is_initial,
            is_final: new.is_final,
            is_active: true,
            metadata: new.metadata,
            created_at: Utc::now(),
        };
        inner.states.insert(state.id, state.clone());
        Ok(state)
    }

    async fn create_transition(&self, new: NewTransition) -> Result<TransitionDefinition> {
        let mut inner = self.inner.lock().unwrap();
        let from = inner.state(new.from_state_id)?;
        let to = inner.state(new.to_state_id)?;
        if from.machine_id != to.machine_id {
            return Err(Error::CrossMachineEdge {
                from: new.from_state_id,
                to: new.to_state_id,
            });
        }
        let transition = TransitionDefinition {
            id: TransitionId::new(),
            machine_id: from.machine_id,
            from_state_id: new.from_state_id,
            to_state_id: new.to_state_id,
            event_name: new.event_name,
            priority: new.priority,
            condition: new.condition,
            is_active: true,
            created_at: Utc::now(),
        };
        inner.transitions.insert(transition.id, transition.clone());
        Ok(transition)
    }

    async fn create_trigger(&self, state_id: StateId, new: NewTrigger) -> Result<Trigger> {
        let mut inner = self.inner.lock().unwrap();
        inner.state(state_id)?;
        let trigger = Trigger {
            id: TriggerId::new(),
            state_id,
            action: new.action,
            is_active: true,
            created_at: Utc::now(),
        };
        inner.triggers.insert(trigger.id, trigger.clone());
        Ok(trigger)
    }

    async fn delete_state(&self, state_id: StateId) -> Result<()> {
        // Single lock scope: the state and everything referencing it go
        // together or not at all.
        let mut inner = self.inner.lock().unwrap();
        inner.state(state_id)?;
        if inner.history_references(state_id) {
            return Err(Error::StateInUse(state_id));
        }
        inner
            .transitions
            .retain(|_, t| t.from_state_id != state_id && t.to_state_id != state_id);
        inner.triggers.retain(|_, t| t.state_id != state_id);
        inner.states.remove(&state_id);
        Ok(())
    }

    async fn set_machine_active(&self, machine_id: MachineId, active: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let machine = inner
            .machines
            .get_mut(&machine_id)
            .ok_or(Error::UnknownMachine(machine_id))?;
        machine.is_active = active;
        machine.updated_at = Utc::now();
        Ok(())
    }

    async fn set_state_active(&self, state_id: StateId, active: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.state(state_id)?.clone();
        if !active
            && state.is_initial
            && state.is_active
            && inner.active_initial_states(state.machine_id).len() == 1
        {
            // Would leave the machine with no active initial state.
            return Err(Error::InitialStateMissing {
                machine_id: state.machine_id,
            });
        }
        if active
            && state.is_initial
            && !state.is_active
            && !inner.active_initial_states(state.machine_id).is_empty()
        {
            // Would give the machine a second active initial state.
            return Err(Error::DuplicateInitialState {
                machine_id: state.machine_id,
            });
        }
        if let Some(state) = inner.states.get_mut(&state_id) {
            state.is_active = active;
        }
        Ok(())
    }

    async fn machine(&self, id: MachineId) -> Result<MachineDefinition> {
        let inner = self.inner.lock().unwrap();
        inner
            .machines
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownMachine(id))
    }

    async fn machine_by_code(&self, entity_type: &str, code: &str) -> Result<MachineDefinition> {
        let inner = self.inner.lock().unwrap();
        inner
            .machines
            .values()
            .find(|m| m.entity_type == entity_type && m.code == code)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("machine {entity_type}/{code}")))
    }

    async fn list_machines(&self) -> Result<Vec<MachineDefinition>> {
        let inner = self.inner.lock().unwrap();
        let mut machines: Vec<_> = inner.machines.values().cloned().collect();
        machines.sort_by(|a, b| (&a.entity_type, &a.code).cmp(&(&b.entity_type, &b.code)));
        Ok(machines)
    }

    async fn state(&self, id: StateId) -> Result<StateDefinition> {
        let inner = self.inner.lock().unwrap();
        inner.state(id).cloned()
    }

    async fn states_of(&self, machine_id: MachineId) -> Result<Vec<StateDefinition>> {
        let inner = self.inner.lock().unwrap();
        let mut states: Vec<_> = inner
            .states
            .values()
            .filter(|s| s.machine_id == machine_id)
            .cloned()
            .collect();
        states.sort_by(|a, b| (a.created_at, a.id.0).cmp(&(b.created_at, b.id.0)));
        Ok(states)
    }

    async fn transitions_of(&self, machine_id: MachineId) -> Result<Vec<TransitionDefinition>> {
        let inner = self.inner.lock().unwrap();
        let mut transitions: Vec<_> = inner
            .transitions
            .values()
            .filter(|t| t.machine_id == machine_id)
            .cloned()
            .collect();
        transitions.sort_by(|a, b| (a.created_at, a.id.0).cmp(&(b.created_at, b.id.0)));
        Ok(transitions)
    }

    async fn initial_states(&self, machine_id: MachineId) -> Result<Vec<StateDefinition>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .active_initial_states(machine_id)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn candidate_transitions(
        &self,
        from_state: StateId,
        event: &str,
    ) -> Result<Vec<TransitionDefinition>> {
        let inner = self.inner.lock().unwrap();
        let mut candidates: Vec<_> = inner
            .transitions
            .values()
            .filter(|t| t.is_active && t.from_state_id == from_state && t.event_name == event)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            (a.priority, a.created_at, a.id.0).cmp(&(b.priority, b.created_at, b.id.0))
        });
        Ok(candidates)
    }

    async fn triggers_of(&self, state_id: StateId) -> Result<Vec<Trigger>> {
        let inner = self.inner.lock().unwrap();
        let mut triggers: Vec<_> = inner
            .triggers
            .values()
            .filter(|t| t.is_active && t.state_id == state_id)
            .cloned()
            .collect();
        triggers.sort_by(|a, b| (a.created_at, a.id.0).cmp(&(b.created_at, b.id.0)));
        Ok(triggers)
    }

    // -- history ------------------------------------------------------------

    async fn last_record(&self, key: &EntityKey) -> Result<Option<HistoryRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.history.get(key).and_then(|r| r.last()).cloned())
    }

    async fn commit(
        &self,
        record: NewHistoryRecord,
        jobs: Vec<TriggerJobPayload>,
    ) -> Result<HistoryRecord> {
        let mut inner = self.inner.lock().unwrap();

        let records = inner.history.entry(record.key.clone()).or_default();
        let last_seq = records.last().map_or(0, |r| r.sequence_no);
        if record.sequence_no != last_seq + 1 {
            return Err(Error::SequenceConflict {
                key: record.key,
                attempted: record.sequence_no,
            });
        }
        if let Some(ref token) = record.idempotency_token
            && records
                .iter()
                .any(|r| r.idempotency_token.as_deref() == Some(token.as_str()))
        {
            // Same uniqueness failure the relational backend reports; the
            // engine resolves it into an idempotent replay.
            return Err(Error::SequenceConflict {
                key: record.key,
                attempted: record.sequence_no,
            });
        }

        let committed = HistoryRecord {
            id: Uuid::new_v4(),
            entity_type: record.key.entity_type,
            entity_id: record.key.entity_id,
            machine_id: record.key.machine_id,
            state_id: record.state_id,
            from_state_id: record.from_state_id,
            event_name: record.event_name,
            context: record.context,
            triggered_by: record.triggered_by,
            idempotency_token: record.idempotency_token,
            sequence_no: record.sequence_no,
            occurred_at: Utc::now(),
        };
        records.push(committed.clone());

        // Outbox rides in the same critical section as the append.
        let now = Instant::now();
        for payload in jobs {
            inner.next_job_id += 1;
            let job_id = inner.next_job_id;
            inner.outbox.push(QueuedJob {
                job_id,
                read_ct: 0,
                visible_at: now,
                payload,
            });
        }

        Ok(committed)
    }

    async fn history(&self, key: &EntityKey, query: &HistoryQuery) -> Result<Vec<HistoryRecord>> {
        let inner = self.inner.lock().unwrap();
        let records = inner.history.get(key).map(Vec::as_slice).unwrap_or(&[]);
        Ok(records
            .iter()
            .filter(|r| r.sequence_no > query.after_sequence)
            .take(query.limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn record_by_token(
        &self,
        key: &EntityKey,
        token: &str,
    ) -> Result<Option<HistoryRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.history.get(key).and_then(|records| {
            records
                .iter()
                .find(|r| r.idempotency_token.as_deref() == Some(token))
                .cloned()
        }))
    }

    // -- trigger outbox -----------------------------------------------------

    async fn claim_job(&self, visibility: Duration) -> Result<Option<TriggerJob>> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let Some(job) = inner.outbox.iter_mut().find(|j| j.visible_at <= now) else {
            return Ok(None);
        };
        job.read_ct += 1;
        job.visible_at = now + visibility;
        Ok(Some(TriggerJob {
            job_id: job.job_id,
            attempts: job.read_ct,
            payload: job.payload.clone(),
        }))
    }

    async fn retire_job(&self, job: &TriggerJob) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.outbox.retain(|j| j.job_id != job.job_id);
        Ok(())
    }

    async fn delay_job(&self, job: &TriggerJob, delay: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(queued) = inner.outbox.iter_mut().find(|j| j.job_id == job.job_id) {
            queued.visible_at = Instant::now() + delay;
        }
        Ok(())
    }

    async fn bury_job(&self, job: &TriggerJob, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.outbox.retain(|j| j.job_id != job.job_id);
        inner.dead.push((job.payload.clone(), reason.to_string()));
        Ok(())
    }
}
