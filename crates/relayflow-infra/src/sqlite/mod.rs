//! SQLite storage layer.
//!
//! The run store and the broker log, each backed by SQLite with WAL mode and
//! split read/write connection pools.

pub mod broker;
pub mod pool;
pub mod run_store;
