//! Start node - flow entry point.

use crate::error::{Error, Result};
use crate::flow::FlowNode;

use super::types::{NodeAction, NodeHandler, Turn};

/// Start node implementation. No side effects; advances immediately.
pub struct StartNode;

impl StartNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StartNode {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeHandler for StartNode {
    fn node_type(&self) -> &str {
        "start"
    }

    fn description(&self) -> &str {
        "Flow entry point; advances to its single next node"
    }

    fn validate(&self, node: &FlowNode) -> Result<()> {
        if node.next_node_ids.len() != 1 {
            return Err(Error::Validation(format!(
                "Start node '{}' must have exactly one outgoing edge",
                node.id
            )));
        }
        Ok(())
    }

    fn execute(&self, node: &FlowNode, _turn: &mut Turn) -> Result<NodeAction> {
        let next = node.single_next().ok_or_else(|| {
            Error::Execution(format!("Start node '{}' has no next node", node.id))
        })?;
        Ok(NodeAction::Advance(next.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn start_node(next: &[&str]) -> FlowNode {
        FlowNode {
            id: "s".to_string(),
            node_type: "start".to_string(),
            config: Value::Null,
            next_node_ids: next.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_start_advances() {
        let node = start_node(&["greet"]);
        let mut turn = Turn::default();
        let action = StartNode::new().execute(&node, &mut turn).unwrap();
        assert_eq!(action, NodeAction::Advance("greet".to_string()));
        assert!(turn.outbound.is_empty());
    }

    #[test]
    fn test_start_requires_single_edge() {
        assert!(StartNode::new().validate(&start_node(&[])).is_err());
        assert!(StartNode::new().validate(&start_node(&["a", "b"])).is_err());
        assert!(StartNode::new().validate(&start_node(&["a"])).is_ok());
    }
}
