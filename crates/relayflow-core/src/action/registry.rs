//! Capability registry: `action_type_id` -> handler.

use std::collections::HashMap;

use super::box_handler::BoxActionHandler;

/// Registry of action handlers, indexed by action type id.
///
/// Built once at startup and shared read-only by every partition worker.
pub struct ActionRegistry {
    handlers: HashMap<String, BoxActionHandler>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler. An existing handler for the same type is replaced.
    pub fn register(&mut self, action_type_id: impl Into<String>, handler: BoxActionHandler) {
        self.handlers.insert(action_type_id.into(), handler);
    }

    pub fn get(&self, action_type_id: &str) -> Option<&BoxActionHandler> {
        self.handlers.get(action_type_id)
    }

    pub fn contains(&self, action_type_id: &str) -> bool {
        self.handlers.contains_key(action_type_id)
    }

    /// Registered type ids, sorted.
    pub fn list_type_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
