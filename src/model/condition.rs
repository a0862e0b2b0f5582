//! Transition guard conditions.
//!
//! Conditions are data, not code: a closed set of tagged variants evaluated
//! against the JSON context map a caller passes to `transition()`. Keeping
//! them declarative means definitions can live in the database or a TOML
//! catalog and still be inspected, diffed, and validated.

use serde::{Deserialize, Serialize};

/// A predicate over the transition context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Context field equals the given value.
    FieldEquals { field: String, value: serde_json::Value },

    /// Context field is one of the given values.
    FieldInSet {
        field: String,
        values: Vec<serde_json::Value>,
    },

    /// Every sub-condition holds. Empty means always true.
    AllOf { conditions: Vec<Condition> },

    /// At least one sub-condition holds. Empty means always false.
    AnyOf { conditions: Vec<Condition> },

    /// The sub-condition does not hold.
    Not { condition: Box<Condition> },
}

impl Condition {
    /// Evaluate against a context map. A non-object context satisfies
    /// nothing that reads a field: missing fields compare unequal, never
    /// error.
    pub fn evaluate(&self, context: &serde_json::Value) -> bool {
        match self {
            Condition::FieldEquals { field, value } => {
                context.get(field).is_some_and(|v| v == value)
            }
            Condition::FieldInSet { field, values } => context
                .get(field)
                .is_some_and(|v| values.iter().any(|candidate| candidate == v)),
            Condition::AllOf { conditions } => conditions.iter().all(|c| c.evaluate(context)),
            Condition::AnyOf { conditions } => conditions.iter().any(|c| c.evaluate(context)),
            Condition::Not { condition } => !condition.evaluate(context),
        }
    }
}
