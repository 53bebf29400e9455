//! Workflow engine: the outbox relay, the stage executor, and the pure
//! pieces they share.
//!
//! - `template` -- `{{field.path}}` resolution against the trigger payload
//! - `retry` -- what to do when a stage action fails
//! - `relay` -- outbox -> broker hand-off
//! - `executor` -- per-partition stage execution and continuation

pub mod executor;
pub mod relay;
pub mod retry;
pub mod template;
