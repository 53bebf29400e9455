//! Infrastructure layer for relayflow.
//!
//! Contains implementations of the ports defined in `relayflow-core`: the
//! SQLite run store and broker, the built-in action handlers, and the config
//! and workflow-file loaders.

pub mod action;
pub mod config;
pub mod sqlite;
pub mod workflow;
