//! Node registry - the closed set of node types.

use std::collections::HashMap;
use std::sync::Arc;

use super::types::{NodeAction, NodeHandler, Turn};
use super::{ConditionNode, EndNode, MessageNode, QuestionNode, StartNode};
use crate::error::{Error, Result};
use crate::flow::FlowNode;

/// Registry of available node types.
///
/// Adding a node type is a compile-time addition here; flows referencing
/// anything else are rejected at save time.
#[derive(Clone)]
pub struct NodeRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl NodeRegistry {
    /// Create a new registry with the built-in node types.
    pub fn new() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };

        registry.register(Arc::new(StartNode::new()));
        registry.register(Arc::new(MessageNode::new()));
        registry.register(Arc::new(QuestionNode::new()));
        registry.register(Arc::new(ConditionNode::new()));
        registry.register(Arc::new(EndNode::new()));

        registry
    }

    /// Create an empty registry (for testing).
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a node type.
    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(handler.node_type().to_string(), handler);
    }

    /// Get a handler by type name.
    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(node_type).cloned()
    }

    /// Check if a node type is registered.
    pub fn has(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    /// Run one node through its handler.
    pub fn execute(&self, node: &FlowNode, turn: &mut Turn) -> Result<NodeAction> {
        let handler = self
            .get(&node.node_type)
            .ok_or_else(|| Error::Execution(format!("Unknown node type: {}", node.node_type)))?;

        handler.execute(node, turn)
    }

    /// List all registered node types.
    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }

    /// Get descriptions of all registered node types.
    pub fn descriptions(&self) -> Vec<(&str, &str)> {
        self.handlers
            .iter()
            .map(|(name, handler)| (name.as_str(), handler.description()))
            .collect()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
