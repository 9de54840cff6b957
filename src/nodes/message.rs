//! Message node - sends templated text to the subject.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::flow::FlowNode;

use super::interpolate::render_text;
use super::types::{NodeAction, NodeHandler, Turn};

/// Message node implementation.
pub struct MessageNode;

impl MessageNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MessageNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct MessageConfig {
    text: String,
}

impl NodeHandler for MessageNode {
    fn node_type(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send templated text and advance"
    }

    fn validate(&self, node: &FlowNode) -> Result<()> {
        let config: MessageConfig = serde_json::from_value(node.config.clone())
            .map_err(|e| Error::Validation(format!("Node '{}': invalid message config: {}", node.id, e)))?;
        if config.text.is_empty() {
            return Err(Error::Validation(format!(
                "Message node '{}' has empty text",
                node.id
            )));
        }
        if node.next_node_ids.len() != 1 {
            return Err(Error::Validation(format!(
                "Message node '{}' must have exactly one outgoing edge",
                node.id
            )));
        }
        Ok(())
    }

    fn execute(&self, node: &FlowNode, turn: &mut Turn) -> Result<NodeAction> {
        let config: MessageConfig = serde_json::from_value(node.config.clone())
            .map_err(|e| Error::Execution(format!("Node '{}': invalid message config: {}", node.id, e)))?;

        let text = render_text(&config.text, &turn.variables);
        turn.push_outbound(&node.id, text);

        let next = node.single_next().ok_or_else(|| {
            Error::Execution(format!("Message node '{}' has no next node", node.id))
        })?;
        Ok(NodeAction::Advance(next.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_node(text: &str) -> FlowNode {
        FlowNode {
            id: "m".to_string(),
            node_type: "message".to_string(),
            config: json!({ "text": text }),
            next_node_ids: vec!["next".to_string()],
        }
    }

    #[test]
    fn test_message_interpolates_and_advances() {
        let node = message_node("Hi {{name}}");
        let mut turn = Turn::new(
            [("name".to_string(), json!("Ana"))].into_iter().collect(),
            None,
        );

        let action = MessageNode::new().execute(&node, &mut turn).unwrap();
        assert_eq!(action, NodeAction::Advance("next".to_string()));
        assert_eq!(turn.outbound.len(), 1);
        assert_eq!(turn.outbound[0].text, "Hi Ana");
        assert_eq!(turn.outbound[0].node_id, "m");
    }

    #[test]
    fn test_message_unresolved_variable_renders_empty() {
        let node = message_node("Hi {{name}}");
        let mut turn = Turn::default();

        MessageNode::new().execute(&node, &mut turn).unwrap();
        assert_eq!(turn.outbound[0].text, "Hi ");
    }

    #[test]
    fn test_message_validate_rejects_missing_text() {
        let node = FlowNode {
            id: "m".to_string(),
            node_type: "message".to_string(),
            config: json!({}),
            next_node_ids: vec!["next".to_string()],
        };
        let err = MessageNode::new().validate(&node).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
