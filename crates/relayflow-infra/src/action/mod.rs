//! Built-in action handlers.
//!
//! - `log` -- records the resolved fields through `tracing`
//! - `webhook` -- POSTs the resolved fields as JSON to the `url` field

pub mod log;
pub mod webhook;

use std::time::Duration;

use relayflow_core::action::box_handler::BoxActionHandler;
use relayflow_core::action::registry::ActionRegistry;

use self::log::LogAction;
use self::webhook::WebhookAction;

/// Registry with every built-in handler.
///
/// `http_timeout` bounds each outbound webhook request. Workflows naming any
/// other action type (`email`, `send-sol`, ...) are dead-lettered as
/// `UnknownActionType` unless the embedder registers a handler for it before
/// building the executor:
///
/// ```ignore
/// let mut registry = builtin_registry(timeout)?;
/// registry.register("email", BoxActionHandler::new(SmtpAction::new(smtp)));
/// let executor = StageExecutor::new(store, broker, Arc::new(registry), settings);
/// ```
pub fn builtin_registry(http_timeout: Duration) -> Result<ActionRegistry, reqwest::Error> {
    let mut registry = ActionRegistry::new();
    registry.register(LogAction::TYPE_ID, BoxActionHandler::new(LogAction));
    registry.register(
        WebhookAction::TYPE_ID,
        BoxActionHandler::new(WebhookAction::new(http_timeout)?),
    );
    Ok(registry)
}
