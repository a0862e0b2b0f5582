//! History records: the immutable half of the data model.
//!
//! The history log is the sole source of truth for "current state". Records
//! are created exactly once per committed transition and never updated or
//! deleted; ordering comes from a per-key sequence number, not wall-clock
//! time, which can collide or go backward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::machine::{MachineId, StateId};

/// Event name recorded on the bootstrap record of every key.
pub const BOOTSTRAP_EVENT: &str = "__init__";

// ---------------------------------------------------------------------------
// Entity key
// ---------------------------------------------------------------------------

/// Identifies one entity under one machine.
///
/// An entity may participate in several machines at once; each key has its
/// own independent history and current-state pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
    pub machine_id: MachineId,
}

impl EntityKey {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        machine_id: MachineId,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            machine_id,
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.entity_type, self.entity_id, self.machine_id)
    }
}

// ---------------------------------------------------------------------------
// History record
// ---------------------------------------------------------------------------

/// An immutable fact: one committed state change for one entity under one
/// machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub machine_id: MachineId,

    /// The state entered by this record.
    pub state_id: StateId,

    /// The state left behind. None only on the bootstrap record.
    pub from_state_id: Option<StateId>,

    /// The event that drove the change; [`BOOTSTRAP_EVENT`] on bootstrap.
    pub event_name: String,

    /// The caller's context map, kept verbatim for audit and replay.
    pub context: serde_json::Value,

    /// Who or what asked for the transition.
    pub triggered_by: String,

    /// Caller-supplied retry token. At most one record per (key, token).
    pub idempotency_token: Option<String>,

    /// Monotonic per key, starting at 1. Totally orders the key's history
    /// and backs optimistic concurrency control.
    pub sequence_no: i64,

    pub occurred_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.entity_id, self.machine_id)
    }
}

/// A record prepared by the engine, pending commit. The store assigns the
/// row id and timestamp; the sequence number is the engine's claim and is
/// what the commit checks.
#[derive(Debug, Clone)]
pub struct NewHistoryRecord {
    pub key: EntityKey,
    pub state_id: StateId,
    pub from_state_id: Option<StateId>,
    pub event_name: String,
    pub context: serde_json::Value,
    pub triggered_by: String,
    pub idempotency_token: Option<String>,
    pub sequence_no: i64,
}

// ---------------------------------------------------------------------------
// Queries and outcomes
// ---------------------------------------------------------------------------

/// Paging window for reading a key's history in sequence order.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    /// Return records with `sequence_no` strictly greater than this.
    pub after_sequence: i64,
    pub limit: i64,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            after_sequence: 0,
            limit: 100,
        }
    }
}

/// What a successful `transition()` (or `initialize()`) reports back.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    /// None when the call bootstrapped the key.
    pub from_state_id: Option<StateId>,
    pub to_state_id: StateId,
    pub record: HistoryRecord,

    /// True when a previously committed idempotency token satisfied the
    /// call without writing anything.
    pub replayed: bool,
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// Fold a key's records, in sequence order, down to the state they produce.
///
/// Verifies the standing invariants along the way: sequence numbers are
/// contiguous from 1, only the first record lacks `from_state_id`, and each
/// record departs from the state its predecessor entered. Returns the final
/// state, `Ok(None)` for an empty history, or a description of the first
/// violated invariant.
pub fn replay(records: &[HistoryRecord]) -> std::result::Result<Option<StateId>, String> {
    let mut current: Option<StateId> = None;
    for (i, record) in records.iter().enumerate() {
        let expected_seq = i as i64 + 1;
        if record.sequence_no != expected_seq {
            return Err(format!(
                "sequence gap: expected {expected_seq}, found {}",
                record.sequence_no
            ));
        }
        if record.from_state_id != current {
            return Err(format!(
                "broken chain at sequence {}: from_state {:?} does not match prior state {:?}",
                record.sequence_no, record.from_state_id, current
            ));
        }
        current = Some(record.state_id);
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: i64, from: Option<StateId>, to: StateId) -> HistoryRecord {
        HistoryRecord {
            id: Uuid::new_v4(),
            entity_type: "bug".into(),
            entity_id: "b1".into(),
            machine_id: MachineId::new(),
            state_id: to,
            from_state_id: from,
            event_name: if from.is_none() {
                BOOTSTRAP_EVENT.into()
            } else {
                "advance".into()
            },
            context: serde_json::Value::Null,
            triggered_by: "test".into(),
            idempotency_token: None,
            sequence_no: seq,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn replay_of_empty_history_is_none() {
        assert_eq!(replay(&[]), Ok(None));
    }

    #[test]
    fn replay_follows_the_chain_to_the_last_record() {
        let (a, b, c) = (StateId::new(), StateId::new(), StateId::new());
        let records = vec![
            record(1, None, a),
            record(2, Some(a), b),
            record(3, Some(b), c),
        ];
        assert_eq!(replay(&records), Ok(Some(c)));
    }

    #[test]
    fn replay_rejects_sequence_gaps() {
        let (a, b) = (StateId::new(), StateId::new());
        let records = vec![record(1, None, a), record(3, Some(a), b)];
        assert!(replay(&records).is_err());
    }

    #[test]
    fn replay_rejects_a_broken_from_chain() {
        let (a, b, c) = (StateId::new(), StateId::new(), StateId::new());
        let records = vec![record(1, None, a), record(2, Some(c), b)];
        assert!(replay(&records).is_err());
    }
}
