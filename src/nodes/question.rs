//! Question node - the only suspension point in a flow.
//!
//! Without input it emits its prompt and suspends. With input it validates,
//! binds the typed value, and advances; invalid input re-emits the same
//! prompt and keeps the flow suspended.

use std::sync::OnceLock;

use regex_lite::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::flow::FlowNode;

use super::interpolate::render_text;
use super::types::{NodeAction, NodeHandler, Turn};

/// Question node implementation.
pub struct QuestionNode;

impl QuestionNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for QuestionNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct QuestionConfig {
    prompt: String,
    variable: String,
    #[serde(default)]
    validation: ValidationRule,
}

/// Accepted answer shapes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ValidationRule {
    /// Any non-empty text
    #[default]
    Text,
    /// Parses as a number; binds as a JSON number
    Numeric,
    /// Looks like an email address
    Email,
}

fn email_regex() -> &'static Regex {
    static EMAIL_REGEX: OnceLock<Regex> = OnceLock::new();
    EMAIL_REGEX.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid regex"))
}

/// Validate raw input and produce the value to bind.
fn accept(rule: ValidationRule, raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    match rule {
        ValidationRule::Text => {
            if trimmed.is_empty() {
                None
            } else {
                Some(Value::String(trimmed.to_string()))
            }
        }
        ValidationRule::Numeric => {
            if let Ok(n) = trimmed.parse::<i64>() {
                return Some(Value::from(n));
            }
            trimmed.parse::<f64>().ok().and_then(|f| {
                serde_json::Number::from_f64(f).map(Value::Number)
            })
        }
        ValidationRule::Email => {
            if email_regex().is_match(trimmed) {
                Some(Value::String(trimmed.to_string()))
            } else {
                None
            }
        }
    }
}

impl NodeHandler for QuestionNode {
    fn node_type(&self) -> &str {
        "question"
    }

    fn description(&self) -> &str {
        "Ask a question, suspend for the answer, bind it to a variable"
    }

    fn validate(&self, node: &FlowNode) -> Result<()> {
        let config: QuestionConfig = serde_json::from_value(node.config.clone())
            .map_err(|e| Error::Validation(format!("Node '{}': invalid question config: {}", node.id, e)))?;
        if config.prompt.is_empty() {
            return Err(Error::Validation(format!(
                "Question node '{}' has empty prompt",
                node.id
            )));
        }
        if config.variable.is_empty() {
            return Err(Error::Validation(format!(
                "Question node '{}' has empty variable name",
                node.id
            )));
        }
        if node.next_node_ids.len() != 1 {
            return Err(Error::Validation(format!(
                "Question node '{}' must have exactly one outgoing edge",
                node.id
            )));
        }
        Ok(())
    }

    fn execute(&self, node: &FlowNode, turn: &mut Turn) -> Result<NodeAction> {
        let config: QuestionConfig = serde_json::from_value(node.config.clone())
            .map_err(|e| Error::Execution(format!("Node '{}': invalid question config: {}", node.id, e)))?;

        let Some(raw) = turn.take_input() else {
            let prompt = render_text(&config.prompt, &turn.variables);
            turn.push_outbound(&node.id, prompt);
            return Ok(NodeAction::Suspend);
        };

        match accept(config.validation, &raw) {
            Some(value) => {
                turn.variables.insert(config.variable.clone(), value);
                let next = node.single_next().ok_or_else(|| {
                    Error::Execution(format!("Question node '{}' has no next node", node.id))
                })?;
                Ok(NodeAction::Advance(next.to_string()))
            }
            None => {
                warn!(
                    node_id = %node.id,
                    variable = %config.variable,
                    "invalid answer, re-prompting"
                );
                let prompt = render_text(&config.prompt, &turn.variables);
                turn.push_outbound(&node.id, prompt);
                Ok(NodeAction::Suspend)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn question_node(validation: &str) -> FlowNode {
        FlowNode {
            id: "q".to_string(),
            node_type: "question".to_string(),
            config: json!({
                "prompt": "How old are you?",
                "variable": "age",
                "validation": validation,
            }),
            next_node_ids: vec!["next".to_string()],
        }
    }

    #[test]
    fn test_question_without_input_suspends_with_prompt() {
        let node = question_node("numeric");
        let mut turn = Turn::default();

        let action = QuestionNode::new().execute(&node, &mut turn).unwrap();
        assert_eq!(action, NodeAction::Suspend);
        assert_eq!(turn.outbound[0].text, "How old are you?");
        assert!(turn.variables.is_empty());
    }

    #[test]
    fn test_question_binds_numeric_answer() {
        let node = question_node("numeric");
        let mut turn = Turn::new(Default::default(), Some("25".to_string()));

        let action = QuestionNode::new().execute(&node, &mut turn).unwrap();
        assert_eq!(action, NodeAction::Advance("next".to_string()));
        assert_eq!(turn.variables["age"], json!(25));
        assert!(turn.outbound.is_empty());
    }

    #[test]
    fn test_question_invalid_answer_reprompts_same_text() {
        let node = question_node("numeric");
        let mut turn = Turn::new(Default::default(), Some("soon".to_string()));

        let action = QuestionNode::new().execute(&node, &mut turn).unwrap();
        assert_eq!(action, NodeAction::Suspend);
        assert_eq!(turn.outbound[0].text, "How old are you?");
        assert!(turn.variables.is_empty());
    }

    #[test]
    fn test_question_email_validation() {
        let node = question_node("email");

        let mut turn = Turn::new(Default::default(), Some("ana@example.com".to_string()));
        let action = QuestionNode::new().execute(&node, &mut turn).unwrap();
        assert_eq!(action, NodeAction::Advance("next".to_string()));
        assert_eq!(turn.variables["age"], json!("ana@example.com"));

        let mut turn = Turn::new(Default::default(), Some("not-an-email".to_string()));
        let action = QuestionNode::new().execute(&node, &mut turn).unwrap();
        assert_eq!(action, NodeAction::Suspend);
    }

    #[test]
    fn test_question_text_rejects_blank() {
        let node = question_node("text");
        let mut turn = Turn::new(Default::default(), Some("   ".to_string()));

        let action = QuestionNode::new().execute(&node, &mut turn).unwrap();
        assert_eq!(action, NodeAction::Suspend);
    }

    #[test]
    fn test_question_decimal_binds_as_number() {
        let node = question_node("numeric");
        let mut turn = Turn::new(Default::default(), Some("2.5".to_string()));

        QuestionNode::new().execute(&node, &mut turn).unwrap();
        assert_eq!(turn.variables["age"], json!(2.5));
    }
}
