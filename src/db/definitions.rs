//! Definition store operations: machines, states, transitions, triggers.
//!
//! Validation leans on the schema where the schema can carry it — unique
//! constraints for code collisions and the single-initial-state invariant,
//! mapped back to typed errors by constraint name — and on explicit checks
//! inside a transaction where it cannot (cross-machine edges, cascading
//! deletes).

use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    Condition, MachineDefinition, MachineId, NewMachine, NewState, NewTransition, NewTrigger,
    StateDefinition, StateId, TransitionDefinition, TransitionId, Trigger, TriggerAction,
    TriggerId,
};

/// Constraint name from a database error, if that is what failed.
fn violated_constraint(err: &sqlx::Error) -> Option<&str> {
    match err {
        sqlx::Error::Database(db) => db.constraint(),
        _ => None,
    }
}

impl super::Db {
    /// Register a new machine. Codes are unique per entity type.
    pub async fn create_machine(&self, new: NewMachine) -> Result<MachineDefinition> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        let inserted = sqlx::query(
            "INSERT INTO machines (id, entity_type, code, name, is_active, created_at, updated_at)
             VALUES ($1, $2, $3, $4, TRUE, $5, $5)",
        )
        .bind(id)
        .bind(&new.entity_type)
        .bind(&new.code)
        .bind(&new.name)
        .bind(now)
        .execute(self.pool())
        .await;

        if let Err(ref e) = inserted
            && violated_constraint(e) == Some("machines_entity_type_code_key")
        {
            return Err(Error::DuplicateMachine {
                entity_type: new.entity_type,
                code: new.code,
            });
        }
        inserted?;

        self.machine(MachineId(id)).await
    }

    /// Add a state to a machine. The partial unique index on
    /// (machine_id) WHERE is_initial AND is_active enforces the
    /// single-initial-state invariant even under concurrent definition
    /// writers.
    pub async fn create_state(
        &self,
        machine_id: MachineId,
        new: NewState,
    ) -> Result<StateDefinition> {
        let known: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM machines WHERE id = $1")
            .bind(machine_id.0)
            .fetch_optional(self.pool())
            .await?;
        if known.is_none() {
            return Err(Error::UnknownMachine(machine_id));
        }

        let id = Uuid::new_v4();
        let inserted = sqlx::query(
            "INSERT INTO machine_states (id, machine_id, code, name, is_initial, is_final, is_active, metadata, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7, $8)",
        )
        .bind(id)
        .bind(machine_id.0)
        .bind(&new.code)
        .bind(&new.name)
        .bind(new.is_initial)
        .bind(new.is_final)
        .bind(&new.metadata)
        .bind(Utc::now())
        .execute(self.pool())
        .await;

        if let Err(ref e) = inserted {
            match violated_constraint(e) {
                Some("machine_states_machine_id_code_key") => {
                    return Err(Error::DuplicateState {
                        machine_id,
                        code: new.code,
                    });
                }
                Some("machine_states_one_initial") => {
                    return Err(Error::DuplicateInitialState { machine_id });
                }
                _ => {}
            }
        }
        inserted?;

        self.state(StateId(id)).await
    }

    /// Register a directed edge. Both endpoints must belong to the same
    /// machine.
    pub async fn create_transition(&self, new: NewTransition) -> Result<TransitionDefinition> {
        let from: Option<(Uuid,)> =
            sqlx::query_as("SELECT machine_id FROM machine_states WHERE id = $1")
                .bind(new.from_state_id.0)
                .fetch_optional(self.pool())
                .await?;
        let from_machine = from.ok_or(Error::UnknownState(new.from_state_id))?.0;

        let to: Option<(Uuid,)> =
            sqlx::query_as("SELECT machine_id FROM machine_states WHERE id = $1")
                .bind(new.to_state_id.0)
                .fetch_optional(self.pool())
                .await?;
        let to_machine = to.ok_or(Error::UnknownState(new.to_state_id))?.0;

        if from_machine != to_machine {
            return Err(Error::CrossMachineEdge {
                from: new.from_state_id,
                to: new.to_state_id,
            });
        }

        let id = Uuid::new_v4();
        let condition = new.condition.as_ref().map(serde_json::to_value).transpose()?;
        sqlx::query(
            "INSERT INTO machine_transitions (id, machine_id, from_state_id, to_state_id, event_name, priority, condition, is_active, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, $8)",
        )
        .bind(id)
        .bind(from_machine)
        .bind(new.from_state_id.0)
        .bind(new.to_state_id.0)
        .bind(&new.event_name)
        .bind(new.priority)
        .bind(condition)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        self.transition(TransitionId(id)).await
    }

    /// Attach a trigger to a state.
    pub async fn create_trigger(&self, state_id: StateId, new: NewTrigger) -> Result<Trigger> {
        let known: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM machine_states WHERE id = $1")
            .bind(state_id.0)
            .fetch_optional(self.pool())
            .await?;
        if known.is_none() {
            return Err(Error::UnknownState(state_id));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO state_triggers (id, state_id, action, is_active, created_at)
             VALUES ($1, $2, $3, TRUE, $4)",
        )
        .bind(id)
        .bind(state_id.0)
        .bind(serde_json::to_value(&new.action)?)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(Trigger {
            id: TriggerId(id),
            state_id,
            action: new.action,
            is_active: true,
            created_at: now,
        })
    }

    /// Delete a state plus every transition and trigger referencing it in
    /// one transaction. Refused once history references the state.
    pub async fn delete_state(&self, state_id: StateId) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        let known: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM machine_states WHERE id = $1")
            .bind(state_id.0)
            .fetch_optional(&mut *tx)
            .await?;
        if known.is_none() {
            return Err(Error::UnknownState(state_id));
        }

        let (referenced,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM entity_history WHERE state_id = $1 OR from_state_id = $1)",
        )
        .bind(state_id.0)
        .fetch_one(&mut *tx)
        .await?;
        if referenced {
            return Err(Error::StateInUse(state_id));
        }

        sqlx::query("DELETE FROM machine_transitions WHERE from_state_id = $1 OR to_state_id = $1")
            .bind(state_id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM state_triggers WHERE state_id = $1")
            .bind(state_id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM machine_states WHERE id = $1")
            .bind(state_id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Soft-disable or re-enable a machine.
    pub async fn set_machine_active(&self, machine_id: MachineId, active: bool) -> Result<()> {
        let rows_affected =
            sqlx::query("UPDATE machines SET is_active = $1, updated_at = $2 WHERE id = $3")
                .bind(active)
                .bind(Utc::now())
                .bind(machine_id.0)
                .execute(self.pool())
                .await?
                .rows_affected();

        if rows_affected == 0 {
            return Err(Error::UnknownMachine(machine_id));
        }
        Ok(())
    }

    /// Soft-disable or re-enable a state. Deactivating the machine's only
    /// active initial state is rejected; re-activating a second initial
    /// state trips the partial unique index.
    pub async fn set_state_active(&self, state_id: StateId, active: bool) -> Result<()> {
        let row: Option<(Uuid, bool, bool)> = sqlx::query_as(
            "SELECT machine_id, is_initial, is_active FROM machine_states WHERE id = $1",
        )
        .bind(state_id.0)
        .fetch_optional(self.pool())
        .await?;
        let (machine_id, is_initial, is_active) = row.ok_or(Error::UnknownState(state_id))?;
        let machine_id = MachineId(machine_id);

        if !active && is_initial && is_active {
            // The partial unique index means this is the machine's only
            // active initial state.
            return Err(Error::InitialStateMissing { machine_id });
        }

        let updated = sqlx::query("UPDATE machine_states SET is_active = $1 WHERE id = $2")
            .bind(active)
            .bind(state_id.0)
            .execute(self.pool())
            .await;

        if let Err(ref e) = updated
            && violated_constraint(e) == Some("machine_states_one_initial")
        {
            return Err(Error::DuplicateInitialState { machine_id });
        }
        updated?;
        Ok(())
    }

    // -- lookups ------------------------------------------------------------

    pub async fn machine(&self, id: MachineId) -> Result<MachineDefinition> {
        let row: Option<MachineRow> = sqlx::query_as(
            "SELECT id, entity_type, code, name, is_active, created_at, updated_at
             FROM machines WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;
        row.map(MachineRow::into_machine).ok_or(Error::UnknownMachine(id))
    }

    pub async fn machine_by_code(&self, entity_type: &str, code: &str) -> Result<MachineDefinition> {
        let row: Option<MachineRow> = sqlx::query_as(
            "SELECT id, entity_type, code, name, is_active, created_at, updated_at
             FROM machines WHERE entity_type = $1 AND code = $2",
        )
        .bind(entity_type)
        .bind(code)
        .fetch_optional(self.pool())
        .await?;
        row.map(MachineRow::into_machine)
            .ok_or_else(|| Error::NotFound(format!("machine {entity_type}/{code}")))
    }

    pub async fn list_machines(&self) -> Result<Vec<MachineDefinition>> {
        let rows: Vec<MachineRow> = sqlx::query_as(
            "SELECT id, entity_type, code, name, is_active, created_at, updated_at
             FROM machines ORDER BY entity_type, code",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(MachineRow::into_machine).collect())
    }

    pub async fn state(&self, id: StateId) -> Result<StateDefinition> {
        let row: Option<StateRow> = sqlx::query_as(
            "SELECT id, machine_id, code, name, is_initial, is_final, is_active, metadata, created_at
             FROM machine_states WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;
        row.map(StateRow::into_state).ok_or(Error::UnknownState(id))
    }

    pub async fn states_of(&self, machine_id: MachineId) -> Result<Vec<StateDefinition>> {
        let rows: Vec<StateRow> = sqlx::query_as(
            "SELECT id, machine_id, code, name, is_initial, is_final, is_active, metadata, created_at
             FROM machine_states WHERE machine_id = $1 ORDER BY created_at, id",
        )
        .bind(machine_id.0)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(StateRow::into_state).collect())
    }

    pub async fn transitions_of(&self, machine_id: MachineId) -> Result<Vec<TransitionDefinition>> {
        let rows: Vec<TransitionRow> = sqlx::query_as(
            "SELECT id, machine_id, from_state_id, to_state_id, event_name, priority, condition, is_active, created_at
             FROM machine_transitions WHERE machine_id = $1 ORDER BY created_at, id",
        )
        .bind(machine_id.0)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(TransitionRow::try_into_transition).collect()
    }

    pub async fn transition(&self, id: TransitionId) -> Result<TransitionDefinition> {
        let row: Option<TransitionRow> = sqlx::query_as(
            "SELECT id, machine_id, from_state_id, to_state_id, event_name, priority, condition, is_active, created_at
             FROM machine_transitions WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;
        row.ok_or_else(|| Error::NotFound(format!("transition {id}")))?
            .try_into_transition()
    }

    pub async fn initial_states(&self, machine_id: MachineId) -> Result<Vec<StateDefinition>> {
        let rows: Vec<StateRow> = sqlx::query_as(
            "SELECT id, machine_id, code, name, is_initial, is_final, is_active, metadata, created_at
             FROM machine_states
             WHERE machine_id = $1 AND is_initial AND is_active
             ORDER BY created_at, id",
        )
        .bind(machine_id.0)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(StateRow::into_state).collect())
    }

    pub async fn candidate_transitions(
        &self,
        from_state: StateId,
        event: &str,
    ) -> Result<Vec<TransitionDefinition>> {
        let rows: Vec<TransitionRow> = sqlx::query_as(
            "SELECT id, machine_id, from_state_id, to_state_id, event_name, priority, condition, is_active, created_at
             FROM machine_transitions
             WHERE from_state_id = $1 AND event_name = $2 AND is_active
             ORDER BY priority, created_at, id",
        )
        .bind(from_state.0)
        .bind(event)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(TransitionRow::try_into_transition).collect()
    }

    pub async fn triggers_of(&self, state_id: StateId) -> Result<Vec<Trigger>> {
        let rows: Vec<TriggerRow> = sqlx::query_as(
            "SELECT id, state_id, action, is_active, created_at
             FROM state_triggers WHERE state_id = $1 AND is_active
             ORDER BY created_at, id",
        )
        .bind(state_id.0)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(TriggerRow::try_into_trigger).collect()
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct MachineRow {
    id: Uuid,
    entity_type: String,
    code: String,
    name: String,
    is_active: bool,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl MachineRow {
    fn into_machine(self) -> MachineDefinition {
        MachineDefinition {
            id: MachineId(self.id),
            code: self.code,
            entity_type: self.entity_type,
            name: self.name,
            is_active: self.is_active,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StateRow {
    id: Uuid,
    machine_id: Uuid,
    code: String,
    name: String,
    is_initial: bool,
    is_final: bool,
    is_active: bool,
    metadata: serde_json::Value,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl StateRow {
    fn into_state(self) -> StateDefinition {
        StateDefinition {
            id: StateId(self.id),
            machine_id: MachineId(self.machine_id),
            code: self.code,
            name: self.name,
            is_initial: self.is_initial,
            is_final: self.is_final,
            is_active: self.is_active,
            metadata: self.metadata,
            created_at: self.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TransitionRow {
    id: Uuid,
    machine_id: Uuid,
    from_state_id: Uuid,
    to_state_id: Uuid,
    event_name: String,
    priority: i32,
    condition: Option<serde_json::Value>,
    is_active: bool,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl TransitionRow {
    fn try_into_transition(self) -> Result<TransitionDefinition> {
        let condition: Option<Condition> =
            self.condition.map(serde_json::from_value).transpose()?;
        Ok(TransitionDefinition {
            id: TransitionId(self.id),
            machine_id: MachineId(self.machine_id),
            from_state_id: StateId(self.from_state_id),
            to_state_id: StateId(self.to_state_id),
            event_name: self.event_name,
            priority: self.priority,
            condition,
            is_active: self.is_active,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TriggerRow {
    id: Uuid,
    state_id: Uuid,
    action: serde_json::Value,
    is_active: bool,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl TriggerRow {
    fn try_into_trigger(self) -> Result<Trigger> {
        let action: TriggerAction = serde_json::from_value(self.action)?;
        Ok(Trigger {
            id: TriggerId(self.id),
            state_id: StateId(self.state_id),
            action,
            is_active: self.is_active,
            created_at: self.created_at,
        })
    }
}
