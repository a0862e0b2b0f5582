//! Machine definitions: the configuration half of the data model.
//!
//! A machine is a named set of states and directed transitions for one
//! entity type. Definitions are created once by whoever owns a business
//! domain, edited rarely, and soft-disabled rather than deleted once live
//! history references them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::condition::Condition;

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

macro_rules! definition_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                // Short display: first 8 chars of UUID
                write!(f, "{}", &self.0.to_string()[..8])
            }
        }
    };
}

definition_id!(
    /// Newtype for machine definition IDs.
    MachineId
);
definition_id!(
    /// Newtype for state definition IDs.
    StateId
);
definition_id!(
    /// Newtype for transition definition IDs.
    TransitionId
);
definition_id!(
    /// Newtype for trigger IDs.
    TriggerId
);

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

/// A reusable state machine declared for one entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineDefinition {
    /// Unique identifier.
    pub id: MachineId,

    /// Short code, unique per entity type (e.g., "bug_lifecycle").
    pub code: String,

    /// The entity type this machine governs (e.g., "bug", "shipment").
    pub entity_type: String,

    /// Human-readable name.
    pub name: String,

    /// Disabled machines refuse transitions but keep their history readable.
    pub is_active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// One node of a machine.
///
/// Invariant: exactly one active state per machine has `is_initial` set.
/// The stores enforce this at definition time; the engine treats a machine
/// found without it as a fatal configuration error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDefinition {
    pub id: StateId,
    pub machine_id: MachineId,

    /// Short code, unique within the machine (e.g., "in_progress").
    pub code: String,

    pub name: String,

    /// Entities with no history bootstrap into this state.
    pub is_initial: bool,

    /// Final states may still have outgoing edges (cycles such as "reopen"
    /// are legal); the flag is advisory for callers rendering lifecycles.
    pub is_final: bool,

    pub is_active: bool,

    /// Free-form annotations for callers (colors, SLA hints, ...). The
    /// engine never interprets these.
    pub metadata: serde_json::Value,

    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// A directed edge between two states of the same machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionDefinition {
    pub id: TransitionId,
    pub machine_id: MachineId,
    pub from_state_id: StateId,
    pub to_state_id: StateId,

    /// The event name a caller supplies to attempt this edge.
    pub event_name: String,

    /// Selection order when several edges share (from, event). Lower runs
    /// first; ties break on creation order.
    pub priority: i32,

    /// Optional guard evaluated against the call's context map. Edges
    /// sharing (from, event) are expected to carry mutually exclusive
    /// conditions; the engine takes the first satisfied one.
    pub condition: Option<Condition>,

    pub is_active: bool,

    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// A side effect scheduled whenever an entity enters a state.
///
/// Execution is decoupled from the transition commit: jobs land on the
/// outbox in the committing unit of work and a worker runs them with
/// at-least-once semantics. Handlers must be idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: TriggerId,
    pub state_id: StateId,
    pub action: TriggerAction,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Closed set of trigger actions. Config is typed per variant rather than
/// an opaque blob interpreted at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerAction {
    /// Write a structured audit line via tracing. Handled in-crate.
    AuditLog {
        #[serde(default)]
        message: Option<String>,
    },
    /// POST the job payload to a URL. Handler supplied by the embedding
    /// application.
    Webhook { url: String },
    /// Notify a channel through the application's notification system.
    Notify { channel: String, template: String },
}

impl TriggerAction {
    /// Stable discriminant used to route jobs to registered handlers.
    pub fn kind(&self) -> &'static str {
        match self {
            TriggerAction::AuditLog { .. } => "audit_log",
            TriggerAction::Webhook { .. } => "webhook",
            TriggerAction::Notify { .. } => "notify",
        }
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Builder for a new machine definition.
pub struct NewMachine {
    pub(crate) entity_type: String,
    pub(crate) code: String,
    pub(crate) name: String,
}

impl NewMachine {
    pub fn new(entity_type: impl Into<String>, code: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            entity_type: entity_type.into(),
            name: code.clone(),
            code,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Builder for a new state definition.
pub struct NewState {
    pub(crate) code: String,
    pub(crate) name: String,
    pub(crate) is_initial: bool,
    pub(crate) is_final: bool,
    pub(crate) metadata: serde_json::Value,
}

impl NewState {
    pub fn new(code: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            name: code.clone(),
            code,
            is_initial: false,
            is_final: false,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn initial(mut self) -> Self {
        self.is_initial = true;
        self
    }

    pub fn r#final(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Builder for a new transition definition.
pub struct NewTransition {
    pub(crate) from_state_id: StateId,
    pub(crate) to_state_id: StateId,
    pub(crate) event_name: String,
    pub(crate) priority: i32,
    pub(crate) condition: Option<Condition>,
}

impl NewTransition {
    pub fn new(from: StateId, to: StateId, event_name: impl Into<String>) -> Self {
        Self {
            from_state_id: from,
            to_state_id: to,
            event_name: event_name.into(),
            priority: 0,
            condition: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// Builder for a new trigger.
pub struct NewTrigger {
    pub(crate) action: TriggerAction,
}

impl NewTrigger {
    pub fn new(action: TriggerAction) -> Self {
        Self { action }
    }
}
