//! Shared domain types for relayflow.
//!
//! Workflow definitions, runs, outbox entries, the stage-event wire format,
//! configuration, and the error types shared between the core engine and its
//! infrastructure adapters.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
