//! Error types for trellis-rs.
//!
//! Three families matter to callers: configuration errors (bad or broken
//! machine definitions, rejected at definition time or fatal at setup),
//! business errors (legal outcomes of asking for a transition the machine
//! does not permit), and concurrency errors (the caller lost a race and
//! must re-read before retrying). Trigger handler failures stay inside the
//! dispatcher and never surface through `transition()`.

use thiserror::Error;

use crate::model::{EntityKey, MachineId, StateId};

#[derive(Debug, Error)]
pub enum Error {
    // -- configuration ------------------------------------------------------
    #[error("unknown machine: {0}")]
    UnknownMachine(MachineId),

    #[error("unknown state: {0}")]
    UnknownState(StateId),

    #[error("machine {code:?} already defined for entity type {entity_type:?}")]
    DuplicateMachine { entity_type: String, code: String },

    #[error("state {code:?} already defined in machine {machine_id}")]
    DuplicateState { machine_id: MachineId, code: String },

    #[error("machine {machine_id} already has an active initial state")]
    DuplicateInitialState { machine_id: MachineId },

    #[error("machine {machine_id} has no active initial state")]
    InitialStateMissing { machine_id: MachineId },

    #[error("machine {machine_id} has more than one active initial state")]
    AmbiguousInitialState { machine_id: MachineId },

    #[error("transition endpoints belong to different machines: {from} -> {to}")]
    CrossMachineEdge { from: StateId, to: StateId },

    #[error("state {0} is referenced by history and cannot be deleted")]
    StateInUse(StateId),

    #[error("machine {0} is disabled")]
    MachineDisabled(MachineId),

    #[error("config error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    // -- business -----------------------------------------------------------
    #[error("no transition from state {state:?} on event {event:?}")]
    TransitionNotAllowed { state: String, event: String },

    #[error("no transition condition satisfied from state {state:?} on event {event:?}")]
    TransitionConditionFailed { state: String, event: String },

    // -- concurrency --------------------------------------------------------
    #[error("sequence conflict on {key}: sequence {attempted} already committed")]
    SequenceConflict { key: EntityKey, attempted: i64 },

    #[error("concurrent transition committed first on {key}; re-read and retry")]
    ConcurrentTransitionConflict { key: EntityKey },

    // -- infrastructure -----------------------------------------------------
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors the caller can resolve by re-reading current state
    /// and retrying the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SequenceConflict { .. } | Error::ConcurrentTransitionConflict { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
