//! Business logic and port trait definitions for relayflow.
//!
//! This crate defines the "ports" (run store, broker, action handler) that
//! the infrastructure layer implements, plus the two engines built on them:
//! the outbox relay and the stage executor. It depends only on
//! `relayflow-types` -- never on `relayflow-infra` or any database/IO crate.

pub mod action;
pub mod broker;
pub mod repository;
pub mod workflow;
