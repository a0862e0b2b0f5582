//! Tests for the TOML machine catalog.

use std::sync::Arc;

use trellis_rs::catalog;
use trellis_rs::engine::{TransitionEngine, TransitionRequest};
use trellis_rs::error::Error;
use trellis_rs::model::{Condition, TriggerAction};
use trellis_rs::store::{MemoryStore, StateStore};

const BUG_LIFECYCLE: &str = r#"
[machine]
entity_type = "bug"
code = "bug_lifecycle"
name = "Bug lifecycle"

[[states]]
code = "open"
name = "Open"
initial = true

[[states]]
code = "in_progress"

[[states]]
code = "closed"
final = true

[[states.triggers]]
action = { type = "audit_log", message = "bug closed" }

[[transitions]]
from = "open"
to = "in_progress"
event = "start"

[[transitions]]
from = "in_progress"
to = "closed"
event = "close"

[transitions.condition]
type = "field_equals"
field = "verified"
value = true
"#;

#[tokio::test]
async fn catalog_file_registers_a_working_machine() {
    let store = Arc::new(MemoryStore::new());
    let spec = catalog::parse_machine_file(BUG_LIFECYCLE).unwrap();
    let machine = catalog::register_machine(store.as_ref(), spec).await.unwrap();
    assert_eq!(machine.entity_type, "bug");
    assert_eq!(machine.code, "bug_lifecycle");

    let states = store.states_of(machine.id).await.unwrap();
    assert_eq!(states.len(), 3);
    let closed = states.iter().find(|s| s.code == "closed").unwrap();
    assert!(closed.is_final);

    let triggers = store.triggers_of(closed.id).await.unwrap();
    assert_eq!(triggers.len(), 1);
    assert!(matches!(triggers[0].action, TriggerAction::AuditLog { .. }));

    let transitions = store.transitions_of(machine.id).await.unwrap();
    assert_eq!(transitions.len(), 2);
    let close = transitions.iter().find(|t| t.event_name == "close").unwrap();
    assert!(matches!(close.condition, Some(Condition::FieldEquals { .. })));

    // The loaded machine actually runs.
    let engine = TransitionEngine::new(Arc::clone(&store));
    engine.initialize("bug", "b1", machine.id, "deploy").await.unwrap();
    let outcome = engine
        .transition(TransitionRequest::new("bug", "b1", machine.id, "start"))
        .await
        .unwrap();
    let entered = store.state(outcome.to_state_id).await.unwrap();
    assert_eq!(entered.code, "in_progress");
}

#[tokio::test]
async fn catalog_goes_through_definition_validation() {
    let store = MemoryStore::new();
    let two_initials = r#"
[machine]
entity_type = "doc"
code = "review"

[[states]]
code = "draft"
initial = true

[[states]]
code = "also_initial"
initial = true
"#;
    let spec = catalog::parse_machine_file(two_initials).unwrap();
    let err = catalog::register_machine(&store, spec).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateInitialState { .. }));
}

#[tokio::test]
async fn transition_referencing_an_undefined_state_is_a_config_error() {
    let store = MemoryStore::new();
    let dangling = r#"
[machine]
entity_type = "doc"
code = "review"

[[states]]
code = "draft"
initial = true

[[transitions]]
from = "draft"
to = "published"
event = "publish"
"#;
    let spec = catalog::parse_machine_file(dangling).unwrap();
    let err = catalog::register_machine(&store, spec).await.unwrap_err();
    match err {
        Error::Config(msg) => assert!(msg.contains("published")),
        other => panic!("expected Config error, got {other:?}"),
    }
}

#[tokio::test]
async fn load_from_dir_registers_every_toml_file() {
    let dir = std::env::temp_dir().join(format!("trellis-catalog-{}", uuid_suffix()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("bug.toml"), BUG_LIFECYCLE).unwrap();
    std::fs::write(dir.join("notes.txt"), "not a machine").unwrap();

    let store = MemoryStore::new();
    let machines = catalog::load_from_dir(&store, &dir).await.unwrap();
    assert_eq!(machines.len(), 1);
    assert_eq!(machines[0].code, "bug_lifecycle");

    std::fs::remove_dir_all(&dir).ok();
}

fn uuid_suffix() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}
