//! Broker wire messages.
//!
//! `StageEvent` is the stage-advancement message, serialized as
//! `{"runId": "...", "stage": N}` with `stage` defaulting to 0 when absent.
//! `DeadLetter` wraps an event whose action exhausted its attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request to execute stage `stage` of run `run_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageEvent {
    pub run_id: Uuid,
    /// Zero-based index into the run's action list.
    #[serde(default)]
    pub stage: u32,
    /// How many times this stage has already failed. Omitted on the wire when zero.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempt: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl StageEvent {
    /// The trigger stage of a freshly relayed run.
    pub fn first(run_id: Uuid) -> Self {
        Self {
            run_id,
            stage: 0,
            attempt: 0,
        }
    }

    /// The follow-up event for the next stage, with a fresh attempt count.
    pub fn next_stage(&self) -> Self {
        Self {
            run_id: self.run_id,
            stage: self.stage + 1,
            attempt: 0,
        }
    }

    /// The same stage again, one attempt later.
    pub fn retry(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..*self
        }
    }

    /// Broker partitioning key. Every event of a run shares it.
    pub fn key(&self) -> String {
        self.run_id.to_string()
    }

    /// Handler idempotency key, stable across redeliveries and retries of a stage.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.run_id, self.stage)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A stage event that will not be retried any further.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub event: StageEvent,
    pub action_type_id: Option<String>,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}
