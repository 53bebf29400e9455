//! Observability setup for relayflow processes.

pub mod tracing_setup;
