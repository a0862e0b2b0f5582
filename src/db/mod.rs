//! Database connection pool, migrations, and health check.
//!
//! Shared Postgres connection pool used by the definition, history and
//! outbox operations. The split mirrors the engine's components: definition
//! queries in `definitions`, the history compare-and-append in `history`,
//! pgmq plumbing in `queue`.

pub mod definitions;
pub mod history;
pub mod queue;

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::Result;
use crate::model::{
    EntityKey, HistoryQuery, HistoryRecord, MachineDefinition, MachineId, NewHistoryRecord,
    NewMachine, NewState, NewTransition, NewTrigger, StateDefinition, StateId,
    TransitionDefinition, Trigger,
};
use crate::store::{StateStore, TriggerJob, TriggerJobPayload};

/// pgmq queue carrying trigger outbox jobs.
pub(crate) const TRIGGER_QUEUE: &str = "triggers";

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check — run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get a reference to the connection pool (for submodules).
    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// The trait surface delegates to the inherent operations the submodules
// define; `Db::x(self, ..)` pins the inherent method so names can match.
#[async_trait]
impl StateStore for Db {
    async fn create_machine(&self, new: NewMachine) -> Result<MachineDefinition> {
        Db::create_machine(self, new).await
    }

    async fn create_state(&self, machine_id: MachineId, new: NewState) -> Result<StateDefinition> {
        Db::create_state(self, machine_id, new).await
    }

    async fn create_transition(&self, new: NewTransition) -> Result<TransitionDefinition> {
        Db::create_transition(self, new).await
    }

    async fn create_trigger(&self, state_id: StateId, new: NewTrigger) -> Result<Trigger> {
        Db::create_trigger(self, state_id, new).await
    }

    async fn delete_state(&self, state_id: StateId) -> Result<()> {
        Db::delete_state(self, state_id).await
    }

    async fn set_machine_active(&self, machine_id: MachineId, active: bool) -> Result<()> {
        Db::set_machine_active(self, machine_id, active).await
    }

    async fn set_state_active(&self, state_id: StateId, active: bool) -> Result<()> {
        Db::set_state_active(self, state_id, active).await
    }

    async fn machine(&self, id: MachineId) -> Result<MachineDefinition> {
        Db::machine(self, id).await
    }

    async fn machine_by_code(&self, entity_type: &str, code: &str) -> Result<MachineDefinition> {
        Db::machine_by_code(self, entity_type, code).await
    }

    async fn list_machines(&self) -> Result<Vec<MachineDefinition>> {
        Db::list_machines(self).await
    }

    async fn state(&self, id: StateId) -> Result<StateDefinition> {
        Db::state(self, id).await
    }

    async fn states_of(&self, machine_id: MachineId) -> Result<Vec<StateDefinition>> {
        Db::states_of(self, machine_id).await
    }

    async fn transitions_of(&self, machine_id: MachineId) -> Result<Vec<TransitionDefinition>> {
        Db::transitions_of(self, machine_id).await
    }

    async fn initial_states(&self, machine_id: MachineId) -> Result<Vec<StateDefinition>> {
        Db::initial_states(self, machine_id).await
    }

    async fn candidate_transitions(
        &self,
        from_state: StateId,
        event: &str,
    ) -> Result<Vec<TransitionDefinition>> {
        Db::candidate_transitions(self, from_state, event).await
    }

    async fn triggers_of(&self, state_id: StateId) -> Result<Vec<Trigger>> {
        Db::triggers_of(self, state_id).await
    }

    async fn last_record(&self, key: &EntityKey) -> Result<Option<HistoryRecord>> {
        Db::last_record(self, key).await
    }

    async fn commit(
        &self,
        record: NewHistoryRecord,
        jobs: Vec<TriggerJobPayload>,
    ) -> Result<HistoryRecord> {
        Db::commit(self, record, jobs).await
    }

    async fn history(&self, key: &EntityKey, query: &HistoryQuery) -> Result<Vec<HistoryRecord>> {
        Db::history(self, key, query).await
    }

    async fn record_by_token(
        &self,
        key: &EntityKey,
        token: &str,
    ) -> Result<Option<HistoryRecord>> {
        Db::record_by_token(self, key, token).await
    }

    async fn claim_job(&self, visibility: Duration) -> Result<Option<TriggerJob>> {
        Db::claim_job(self, visibility).await
    }

    async fn retire_job(&self, job: &TriggerJob) -> Result<()> {
        Db::retire_job(self, job).await
    }

    async fn delay_job(&self, job: &TriggerJob, delay: Duration) -> Result<()> {
        Db::delay_job(self, job, delay).await
    }

    async fn bury_job(&self, job: &TriggerJob, reason: &str) -> Result<()> {
        Db::bury_job(self, job, reason).await
    }
}
