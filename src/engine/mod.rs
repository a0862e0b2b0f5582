//! The engine: transition algorithm and the trigger dispatch worker.

pub mod dispatch;
pub mod transition;

pub use dispatch::{
    AuditLogHandler, DispatcherConfig, HandlerRegistry, TriggerDispatcher, TriggerHandler,
};
pub use transition::{TransitionEngine, TransitionRequest};
