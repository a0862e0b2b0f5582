//! Span helpers for the transition path.

use tracing::Span;

use crate::model::MachineId;

/// Span wrapping one `transition()` call end to end.
pub fn start_transition_span(
    entity_type: &str,
    entity_id: &str,
    machine_id: MachineId,
    event: &str,
) -> Span {
    tracing::info_span!(
        "lifecycle.transition",
        "entity.type" = entity_type,
        "entity.id" = entity_id,
        "machine.id" = %machine_id,
        "event" = event,
    )
}

/// Record the state change on the current span's scope. `from` is None for
/// a bootstrap.
pub fn record_state_change(from: Option<&str>, to: &str) {
    tracing::info!(from = from.unwrap_or("<uninitialized>"), to, "state_change");
}
