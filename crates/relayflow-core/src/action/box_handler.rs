//! BoxActionHandler -- object-safe dynamic dispatch wrapper for ActionHandler.
//!
//! 1. `ActionHandlerDyn` is the object-safe twin with a boxed future
//! 2. Blanket impl of `ActionHandlerDyn` for every `T: ActionHandler`
//! 3. `BoxActionHandler` wraps `Box<dyn ActionHandlerDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use super::{ActionError, ActionHandler, ActionInvocation};

/// Object-safe version of [`ActionHandler`] with a boxed future.
pub trait ActionHandlerDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        invocation: &'a ActionInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, ActionError>> + Send + 'a>>;
}

impl<T: ActionHandler> ActionHandlerDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        invocation: &'a ActionInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, ActionError>> + Send + 'a>> {
        Box::pin(self.execute(invocation))
    }
}

/// Type-erased action handler.
///
/// `ActionHandler` uses RPITIT and cannot be a trait object, so the registry
/// stores handlers behind this wrapper.
pub struct BoxActionHandler {
    inner: Box<dyn ActionHandlerDyn + Send + Sync>,
}

impl BoxActionHandler {
    pub fn new<T: ActionHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub async fn execute(
        &self,
        invocation: &ActionInvocation,
    ) -> Result<serde_json::Value, ActionError> {
        self.inner.execute_boxed(invocation).await
    }
}
