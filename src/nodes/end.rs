//! End node - terminates the flow.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::flow::FlowNode;

use super::interpolate::render_text;
use super::types::{NodeAction, NodeHandler, PostAction, Turn};

/// End node implementation.
pub struct EndNode;

impl EndNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EndNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Deserialize)]
struct EndConfig {
    #[serde(default)]
    message: Option<String>,

    /// Hand-offs for external collaborators; collected, not executed here
    #[serde(default)]
    actions: Vec<PostAction>,
}

impl EndNode {
    fn parse_config(node: &FlowNode) -> Result<EndConfig> {
        if node.config.is_null() {
            return Ok(EndConfig::default());
        }
        serde_json::from_value(node.config.clone()).map_err(|e| {
            Error::Execution(format!("Node '{}': invalid end config: {}", node.id, e))
        })
    }
}

impl NodeHandler for EndNode {
    fn node_type(&self) -> &str {
        "end"
    }

    fn description(&self) -> &str {
        "Terminate the flow, optionally with a final message and post-actions"
    }

    fn validate(&self, node: &FlowNode) -> Result<()> {
        if !node.next_node_ids.is_empty() {
            return Err(Error::Validation(format!(
                "End node '{}' must have no outgoing edges",
                node.id
            )));
        }
        if !node.config.is_null() {
            serde_json::from_value::<EndConfig>(node.config.clone()).map_err(|e| {
                Error::Validation(format!("Node '{}': invalid end config: {}", node.id, e))
            })?;
        }
        Ok(())
    }

    fn execute(&self, node: &FlowNode, turn: &mut Turn) -> Result<NodeAction> {
        let config = Self::parse_config(node)?;

        if let Some(message) = &config.message {
            let text = render_text(message, &turn.variables);
            turn.push_outbound(&node.id, text);
        }
        turn.actions.extend(config.actions);

        Ok(NodeAction::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_end_with_message_and_actions() {
        let node = FlowNode {
            id: "e".to_string(),
            node_type: "end".to_string(),
            config: json!({
                "message": "Bye {{name}}",
                "actions": [
                    { "type": "save_variable", "name": "age" },
                    { "type": "notify", "target": "ops" }
                ]
            }),
            next_node_ids: vec![],
        };
        let mut turn = Turn::new(
            [("name".to_string(), json!("Ana"))].into_iter().collect(),
            None,
        );

        let action = EndNode::new().execute(&node, &mut turn).unwrap();
        assert_eq!(action, NodeAction::Complete);
        assert_eq!(turn.outbound[0].text, "Bye Ana");
        assert_eq!(turn.actions.len(), 2);
        assert!(matches!(turn.actions[0], PostAction::SaveVariable { .. }));
    }

    #[test]
    fn test_end_bare() {
        let node = FlowNode {
            id: "e".to_string(),
            node_type: "end".to_string(),
            config: Value::Null,
            next_node_ids: vec![],
        };
        let mut turn = Turn::default();

        let action = EndNode::new().execute(&node, &mut turn).unwrap();
        assert_eq!(action, NodeAction::Complete);
        assert!(turn.outbound.is_empty());
        assert!(turn.actions.is_empty());
    }

    #[test]
    fn test_end_rejects_outgoing_edges() {
        let node = FlowNode {
            id: "e".to_string(),
            node_type: "end".to_string(),
            config: Value::Null,
            next_node_ids: vec!["x".to_string()],
        };
        assert!(EndNode::new().validate(&node).is_err());
    }
}
