//! HTTP surface of worker processes.

pub mod health;
