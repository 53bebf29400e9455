//! Workflow domain types for relayflow.
//!
//! A `WorkflowDefinition` is one trigger followed by an ordered list of
//! actions. A `WorkflowRun` is one firing of that trigger, and an
//! `OutboxEntry` is the durable marker that the run's first stage event has
//! not yet been handed to the broker.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorkflowError;

/// Action configuration: field name -> template string.
///
/// Templates may reference trigger payload fields with `{{field.path}}`
/// placeholders; they are resolved by the executor right before dispatch.
pub type ActionMetadata = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A registered workflow: one trigger and its ordered actions.
///
/// Owned by the run store. The executor only ever reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned on registration.
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// The trigger that starts a run.
    pub trigger: TriggerSpec,
    /// Actions, each carrying its zero-based `sorting_order`.
    pub actions: Vec<ActionSpec>,
}

/// What fires a workflow (e.g. an inbound webhook).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub id: Uuid,
    /// Trigger type id (e.g. "webhook").
    pub trigger_type_id: String,
    /// Opaque trigger-type-specific configuration.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// One action of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    pub id: Uuid,
    /// Action type id, the key into the action handler registry (e.g. "email").
    pub action_type_id: String,
    /// Zero-based position within the workflow. Unique and contiguous.
    pub sorting_order: u32,
    /// Template fields resolved against the trigger payload.
    #[serde(default)]
    pub metadata: ActionMetadata,
}

impl WorkflowDefinition {
    /// The action that runs at `stage`, if any.
    pub fn action_at(&self, stage: u32) -> Option<&ActionSpec> {
        self.actions.iter().find(|a| a.sorting_order == stage)
    }

    /// Index of the terminal stage (`N - 1`), or `None` for an empty workflow.
    pub fn last_stage(&self) -> Option<u32> {
        (self.actions.len() as u32).checked_sub(1)
    }

    /// Whether `stage` is the terminal stage.
    pub fn is_last_stage(&self, stage: u32) -> bool {
        self.last_stage() == Some(stage)
    }

    /// Check the structural invariants: at least one action, non-empty type
    /// ids, and sorting orders forming exactly `0..N`.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.actions.is_empty() {
            return Err(WorkflowError::NoActions);
        }

        let mut seen = BTreeSet::new();
        for action in &self.actions {
            if action.action_type_id.trim().is_empty() {
                return Err(WorkflowError::InvalidActionType(
                    action.action_type_id.clone(),
                ));
            }
            if !seen.insert(action.sorting_order) {
                return Err(WorkflowError::DuplicateSortingOrder(action.sorting_order));
            }
        }

        let count = self.actions.len() as u32;
        if let Some(missing) = (0..count).find(|order| !seen.contains(order)) {
            return Err(WorkflowError::MissingSortingOrder(missing));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Runs and outbox
// ---------------------------------------------------------------------------

/// One instantiation of a workflow, created when the trigger fires.
///
/// Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// UUIDv7 run ID.
    pub id: Uuid,
    /// The definition being executed.
    pub workflow_id: Uuid,
    /// Trigger payload (e.g. the webhook body).
    pub trigger_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A run together with the definition it executes, as loaded by the executor.
#[derive(Debug, Clone)]
pub struct RunWithDefinition {
    pub run: WorkflowRun,
    pub definition: WorkflowDefinition,
}

/// Pending hand-off of a run's first stage event to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
