//! `webhook` action: POSTs the resolved fields to a URL.
//!
//! The `url` field is the target; every other field goes into the JSON body.
//! The stage's idempotency key is sent as the `Idempotency-Key` header so
//! receivers can discard redeliveries.

use std::collections::BTreeMap;
use std::time::Duration;

use relayflow_core::action::{ActionError, ActionHandler, ActionInvocation, ActionOutput};

pub struct WebhookAction {
    client: reqwest::Client,
}

impl WebhookAction {
    pub const TYPE_ID: &'static str = "webhook";

    /// Create a handler whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl ActionHandler for WebhookAction {
    async fn execute(&self, invocation: &ActionInvocation) -> Result<ActionOutput, ActionError> {
        let url = invocation.require("url")?;
        let body: BTreeMap<&str, &str> = invocation
            .fields
            .iter()
            .filter(|(name, _)| name.as_str() != "url")
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();

        let response = self
            .client
            .post(url)
            .header("Idempotency-Key", &invocation.idempotency_key)
            .header("X-Relayflow-Run-Id", invocation.run_id.to_string())
            .header("X-Relayflow-Stage", invocation.stage.to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    ActionError::InvalidInput(format!("invalid webhook url '{url}': {e}"))
                } else {
                    ActionError::Failed(format!("HTTP request failed: {e}"))
                }
            })?;

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) if status.is_success() => {
                return Err(ActionError::Failed(format!(
                    "HTTP {status}: failed to read response body: {e}"
                )));
            }
            Err(e) => {
                tracing::debug!(%status, error = %e, "failed to read webhook error body");
                String::new()
            }
        };
        if !status.is_success() {
            return Err(ActionError::Failed(format!("HTTP {status}: {text}")));
        }

        tracing::debug!(
            run_id = %invocation.run_id,
            stage = invocation.stage,
            status = status.as_u16(),
            "webhook delivered"
        );

        let response_body =
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
        Ok(serde_json::json!({
            "status": status.as_u16(),
            "body": response_body,
        }))
    }
}
