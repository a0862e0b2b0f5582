//! Core data model.
//!
//! Split along the configuration/fact line: machine, state, transition and
//! trigger definitions are configuration (created once, edited rarely);
//! history records are immutable facts appended once per committed
//! transition.

pub mod condition;
pub mod history;
pub mod machine;

pub use condition::Condition;
pub use history::{
    BOOTSTRAP_EVENT, EntityKey, HistoryQuery, HistoryRecord, NewHistoryRecord, TransitionOutcome,
    replay,
};
pub use machine::{
    MachineDefinition, MachineId, NewMachine, NewState, NewTransition, NewTrigger,
    StateDefinition, StateId, TransitionDefinition, TransitionId, Trigger, TriggerAction,
    TriggerId,
};
