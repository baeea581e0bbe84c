//! Type tag -> handler lookup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    ExecutableNode,
    builtin::{EchoNode, EndNode, HttpNode, StartNode},
};

/// Open mapping from a node `type` string to its handler.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    handlers: HashMap<String, Arc<dyn ExecutableNode>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with `start`, `end`, `echo` and `http`.
    pub fn with_builtins(http_client: reqwest::Client) -> Self {
        let mut registry = Self::new();
        registry.register("start", Arc::new(StartNode));
        registry.register("end", Arc::new(EndNode));
        registry.register("echo", Arc::new(EchoNode));
        registry.register("http", Arc::new(HttpNode::new(http_client)));
        registry
    }

    /// Register `handler` for `node_type`.  A later registration replaces an
    /// earlier one; the replaced handler is returned.
    pub fn register(
        &mut self,
        node_type: impl Into<String>,
        handler: Arc<dyn ExecutableNode>,
    ) -> Option<Arc<dyn ExecutableNode>> {
        self.handlers.insert(node_type.into(), handler)
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn ExecutableNode>> {
        self.handlers.get(node_type).cloned()
    }

    /// Registered type tags, sorted.
    pub fn node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("node_types", &self.node_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::mock::MockNode;

    #[test]
    fn builtins_are_registered() {
        let registry = NodeRegistry::with_builtins(reqwest::Client::new());
        assert_eq!(registry.node_types(), vec!["echo", "end", "http", "start"]);
        assert!(registry.get("http").is_some());
        assert!(registry.get("email").is_none());
    }

    #[test]
    fn last_registration_wins() {
        let mut registry = NodeRegistry::new();
        assert!(registry
            .register("custom", Arc::new(MockNode::returning("first", json!({}))))
            .is_none());
        let replaced = registry.register("custom", Arc::new(MockNode::returning("second", json!({}))));
        assert!(replaced.is_some());
        assert_eq!(registry.node_types(), vec!["custom"]);
    }
}
