//! Action handlers: the side-effecting step a workflow stage performs.
//!
//! A handler receives an `ActionInvocation` whose fields are the action's
//! metadata with every `{{path}}` placeholder already resolved against the
//! run's trigger payload. Handlers are looked up by `action_type_id` in the
//! `ActionRegistry`.

pub mod box_handler;
pub mod registry;

use std::collections::BTreeMap;
use std::time::Duration;

use uuid::Uuid;

/// What a successful handler returns. Logged with the stage outcome.
pub type ActionOutput = serde_json::Value;

/// Everything a handler needs to perform one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionInvocation {
    pub run_id: Uuid,
    pub stage: u32,
    /// Zero on the first try; incremented on every retry of this stage.
    pub attempt: u32,
    pub action_id: Uuid,
    pub action_type_id: String,
    /// Resolved action metadata.
    pub fields: BTreeMap<String, String>,
    /// `"{run_id}:{stage}"`. Identical across redeliveries and retries, so
    /// handlers with external side effects can deduplicate on it.
    pub idempotency_key: String,
}

impl ActionInvocation {
    /// Look up a resolved field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Look up a field the handler cannot run without.
    pub fn require(&self, name: &str) -> Result<&str, ActionError> {
        self.field(name)
            .ok_or_else(|| ActionError::InvalidInput(format!("missing field '{name}'")))
    }
}

/// Errors a handler can report.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("action failed: {0}")]
    Failed(String),

    #[error("invalid action input: {0}")]
    InvalidInput(String),

    #[error("action timed out after {0:?}")]
    Timeout(Duration),
}

/// A side-effecting action implementation.
///
/// Uses RPITIT for the async method. Wrap implementations in
/// [`box_handler::BoxActionHandler`] to store them in the registry.
pub trait ActionHandler: Send + Sync {
    /// Perform the action.
    fn execute(
        &self,
        invocation: &ActionInvocation,
    ) -> impl std::future::Future<Output = Result<ActionOutput, ActionError>> + Send;
}
