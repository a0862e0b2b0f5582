//! Machine catalog: declarative machine definitions from TOML files.
//!
//! A business domain checks its lifecycle in as a `.toml` file and loads it
//! at deploy time. Loading goes through the Definition Store operations, so
//! every definition-time validation (single initial state, same-machine
//! edges, code uniqueness) applies to cataloged machines exactly as it does
//! to ones registered through the API.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::model::{
    Condition, MachineDefinition, NewMachine, NewState, NewTransition, NewTrigger, TriggerAction,
};
use crate::store::StateStore;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
pub struct MachineFile {
    pub machine: MachineMeta,
    #[serde(default)]
    pub states: Vec<StateEntry>,
    #[serde(default)]
    pub transitions: Vec<TransitionEntry>,
}

/// The machine's identity block.
#[derive(Debug, Deserialize)]
pub struct MachineMeta {
    pub entity_type: String,
    pub code: String,
    pub name: Option<String>,
}

/// One state, with its triggers inline.
#[derive(Debug, Deserialize)]
pub struct StateEntry {
    pub code: String,
    pub name: Option<String>,
    #[serde(default)]
    pub initial: bool,
    #[serde(default, rename = "final")]
    pub is_final: bool,
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub triggers: Vec<TriggerEntry>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerEntry {
    pub action: TriggerAction,
}

/// One edge, endpoints referenced by state code.
#[derive(Debug, Deserialize)]
pub struct TransitionEntry {
    pub from: String,
    pub to: String,
    pub event: String,
    #[serde(default)]
    pub priority: i32,
    pub condition: Option<Condition>,
}

/// Parse a machine file's contents.
pub fn parse_machine_file(content: &str) -> Result<MachineFile> {
    toml::from_str(content).map_err(|e| Error::Config(format!("bad machine file: {e}")))
}

/// Register one parsed machine through the store.
pub async fn register_machine<S: StateStore>(
    store: &S,
    spec: MachineFile,
) -> Result<MachineDefinition> {
    let mut new_machine = NewMachine::new(&spec.machine.entity_type, &spec.machine.code);
    if let Some(ref name) = spec.machine.name {
        new_machine = new_machine.name(name);
    }
    let machine = store.create_machine(new_machine).await?;

    let mut state_ids = HashMap::new();
    for entry in &spec.states {
        let mut new_state = NewState::new(&entry.code);
        if let Some(ref name) = entry.name {
            new_state = new_state.name(name);
        }
        if entry.initial {
            new_state = new_state.initial();
        }
        if entry.is_final {
            new_state = new_state.r#final();
        }
        if let Some(ref metadata) = entry.metadata {
            new_state = new_state.metadata(metadata.clone());
        }
        let state = store.create_state(machine.id, new_state).await?;
        for trigger in &entry.triggers {
            store
                .create_trigger(state.id, NewTrigger::new(trigger.action.clone()))
                .await?;
        }
        state_ids.insert(entry.code.clone(), state.id);
    }

    let resolve = |code: &str| {
        state_ids.get(code).copied().ok_or_else(|| {
            Error::Config(format!(
                "machine {}: transition references undefined state {code:?}",
                spec.machine.code
            ))
        })
    };
    for entry in &spec.transitions {
        let mut new_transition =
            NewTransition::new(resolve(&entry.from)?, resolve(&entry.to)?, &entry.event)
                .priority(entry.priority);
        if let Some(ref condition) = entry.condition {
            new_transition = new_transition.condition(condition.clone());
        }
        store.create_transition(new_transition).await?;
    }

    info!(
        machine = %machine.code,
        entity_type = %machine.entity_type,
        states = spec.states.len(),
        transitions = spec.transitions.len(),
        "machine registered from catalog"
    );
    Ok(machine)
}

/// Load and register every `.toml` file in a directory.
pub async fn load_from_dir<S: StateStore>(
    store: &S,
    dir: &Path,
) -> Result<Vec<MachineDefinition>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::Config(format!("cannot read catalog dir {}: {e}", dir.display())))?;

    let mut machines = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "toml") {
            let content = std::fs::read_to_string(&path)?;
            let spec = parse_machine_file(&content)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
            machines.push(register_machine(store, spec).await?);
        }
    }
    Ok(machines)
}
