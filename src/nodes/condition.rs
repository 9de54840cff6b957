//! Condition node - two-way branch on a conversation variable.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::flow::FlowNode;

use super::types::{NodeAction, NodeHandler, Turn};

/// Condition node implementation.
pub struct ConditionNode;

impl ConditionNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ConditionNode {
    fn default() -> Self {
        Self::new()
    }
}

const OPERATORS: [&str; 4] = ["==", ">", "<", "contains"];

#[derive(Debug, Deserialize)]
struct ConditionConfig {
    field: String,
    op: String,
    value: Value,
    true_next: String,
    false_next: String,
}

impl ConditionNode {
    fn parse_config(node: &FlowNode) -> Result<ConditionConfig> {
        serde_json::from_value(node.config.clone()).map_err(|e| {
            Error::Execution(format!("Node '{}': invalid condition config: {}", node.id, e))
        })
    }
}

impl NodeHandler for ConditionNode {
    fn node_type(&self) -> &str {
        "condition"
    }

    fn description(&self) -> &str {
        "Branch on a variable comparison (==, >, <, contains)"
    }

    fn validate(&self, node: &FlowNode) -> Result<()> {
        let config: ConditionConfig = serde_json::from_value(node.config.clone())
            .map_err(|e| Error::Validation(format!("Node '{}': invalid condition config: {}", node.id, e)))?;
        if !OPERATORS.contains(&config.op.as_str()) {
            return Err(Error::Validation(format!(
                "Node '{}': unsupported operator '{}', expected one of {:?}",
                node.id, config.op, OPERATORS
            )));
        }
        if config.field.is_empty() {
            return Err(Error::Validation(format!(
                "Condition node '{}' has empty field",
                node.id
            )));
        }
        if config.true_next.is_empty() || config.false_next.is_empty() {
            return Err(Error::Validation(format!(
                "Condition node '{}' must name both true_next and false_next",
                node.id
            )));
        }
        if !node.next_node_ids.is_empty() {
            return Err(Error::Validation(format!(
                "Condition node '{}' branches via config, next_node_ids must be empty",
                node.id
            )));
        }
        Ok(())
    }

    fn branch_targets(&self, node: &FlowNode) -> Vec<String> {
        match Self::parse_config(node) {
            Ok(config) => vec![config.true_next, config.false_next],
            Err(_) => Vec::new(),
        }
    }

    fn execute(&self, node: &FlowNode, turn: &mut Turn) -> Result<NodeAction> {
        let config = Self::parse_config(node)?;

        let passed = match turn.variables.get(&config.field) {
            Some(left) => evaluate(left, &config.op, &config.value, &node.id)?,
            None => {
                warn!(
                    node_id = %node.id,
                    field = %config.field,
                    "condition variable unresolved, taking false branch"
                );
                false
            }
        };

        let branch = if passed { config.true_next } else { config.false_next };
        Ok(NodeAction::Advance(branch))
    }
}

fn evaluate(left: &Value, op: &str, right: &Value, node_id: &str) -> Result<bool> {
    match op {
        "==" => Ok(loose_eq(left, right)),
        ">" | "<" => {
            let (Some(l), Some(r)) = (as_f64(left), as_f64(right)) else {
                warn!(
                    node_id,
                    op,
                    "non-numeric operand in comparison, taking false branch"
                );
                return Ok(false);
            };
            Ok(if op == ">" { l > r } else { l < r })
        }
        "contains" => match left {
            Value::String(s) => Ok(right
                .as_str()
                .map(|needle| s.contains(needle))
                .unwrap_or(false)),
            Value::Array(items) => Ok(items.contains(right)),
            Value::Object(map) => Ok(right.as_str().map(|k| map.contains_key(k)).unwrap_or(false)),
            _ => Ok(false),
        },
        _ => Err(Error::Execution(format!(
            "Node '{}': unsupported operator '{}'",
            node_id, op
        ))),
    }
}

/// Equality across the string/number seam: "25" == 25 holds because
/// question answers arrive as text.
fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (as_f64(left), as_f64(right)) {
        (Some(l), Some(r)) => l == r,
        _ => stringify(left) == stringify(right),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        _ => value.to_string(),
    }
}
