//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Instruments are created lazily from the `"trellis"` meter.

use opentelemetry::metrics::{Counter, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("trellis")
}

/// Counter: transition calls by outcome.
/// Labels: `machine`, `result` ("committed" | "bootstrap" | "replayed" |
/// "not_allowed" | "condition_failed" | "conflict" | "error").
pub fn transitions() -> Counter<u64> {
    meter()
        .u64_counter("trellis.transitions")
        .with_description("Transition calls by outcome")
        .build()
}

/// Counter: outbox queue operations.
/// Labels: `operation` ("claim" | "retire" | "delay" | "bury").
pub fn outbox_operations() -> Counter<u64> {
    meter()
        .u64_counter("trellis.outbox.operations")
        .with_description("Trigger outbox operations")
        .build()
}

/// Counter: trigger handler executions.
/// Labels: `action`, `result` ("ok" | "retry" | "dead" | "unroutable").
pub fn trigger_executions() -> Counter<u64> {
    meter()
        .u64_counter("trellis.triggers.executions")
        .with_description("Trigger handler executions by result")
        .build()
}
