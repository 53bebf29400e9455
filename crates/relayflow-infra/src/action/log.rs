//! `log` action: writes the resolved fields to the log and succeeds.

use relayflow_core::action::{ActionError, ActionHandler, ActionInvocation, ActionOutput};

pub struct LogAction;

impl LogAction {
    pub const TYPE_ID: &'static str = "log";
}

impl ActionHandler for LogAction {
    async fn execute(&self, invocation: &ActionInvocation) -> Result<ActionOutput, ActionError> {
        let fields = serde_json::to_value(&invocation.fields)
            .map_err(|e| ActionError::InvalidInput(e.to_string()))?;

        match invocation.field("message") {
            Some(message) => tracing::info!(
                run_id = %invocation.run_id,
                stage = invocation.stage,
                "{message}"
            ),
            None => tracing::info!(
                run_id = %invocation.run_id,
                stage = invocation.stage,
                fields = %fields,
                "log action"
            ),
        }

        Ok(fields)
    }
}
