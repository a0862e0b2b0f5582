//! # trellis-rs
//!
//! Generic entity state-machine engine. Any entity type declares a named
//! finite-state machine, registers legal transitions, and gets every
//! lifecycle change recorded as an immutable, replayable history.
//!
//! Provides the definition store (machines, states, transitions,
//! triggers), the append-only history log that is the sole source of truth
//! for current state, the transition engine with per-key optimistic
//! concurrency, and the outbox-backed trigger dispatcher. Postgres (sqlx +
//! pgmq) in production; an in-memory store for embedding and tests.

pub mod catalog;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod store;
pub mod telemetry;
