//! Node handler trait and turn types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::flow::FlowNode;

/// What the interpreter should do after a node ran.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeAction {
    /// Move to the named node and keep stepping.
    Advance(String),
    /// Stop here and wait for subject input; the node runs again on resume.
    Suspend,
    /// The flow reached an end node.
    Complete,
}

/// An outbound message produced by a node, delivered later by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Node that produced the message
    pub node_id: String,
    /// Rendered text
    pub text: String,
}

/// Side effects an end node hands off to external collaborators.
///
/// These are data, not behavior: the engine surfaces them to whoever owns
/// contact records and operator notifications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PostAction {
    SaveVariable {
        name: String,
        #[serde(default)]
        value: Value,
    },
    Notify {
        target: String,
        #[serde(default)]
        message: String,
    },
    UpdateContact {
        field: String,
        #[serde(default)]
        value: Value,
    },
}

/// Mutable context for one interpreter turn.
///
/// Handlers read and write conversation variables, consume at most one
/// piece of subject input, and accumulate outbound messages and
/// post-actions. The interpreter moves variables in from the execution
/// state before the turn and back out after it.
#[derive(Debug, Default)]
pub struct Turn {
    /// Conversation variables
    pub variables: HashMap<String, Value>,

    /// Outbound messages produced this turn, in order
    pub outbound: Vec<OutboundMessage>,

    /// Post-actions collected from end nodes this turn
    pub actions: Vec<PostAction>,

    input: Option<String>,
}

impl Turn {
    /// Create a turn over the given variables, with optional subject input.
    pub fn new(variables: HashMap<String, Value>, input: Option<String>) -> Self {
        Self {
            variables,
            outbound: Vec::new(),
            actions: Vec::new(),
            input,
        }
    }

    /// Consume the subject input. Only the first taker gets it.
    pub fn take_input(&mut self) -> Option<String> {
        self.input.take()
    }

    /// Queue an outbound message.
    pub fn push_outbound(&mut self, node_id: &str, text: impl Into<String>) {
        self.outbound.push(OutboundMessage {
            node_id: node_id.to_string(),
            text: text.into(),
        });
    }
}

/// Trait that all node types must implement.
///
/// Handlers are synchronous state transitions: they never perform I/O.
/// Delivery of the accumulated outbound messages happens at the engine
/// seam, after the turn.
pub trait NodeHandler: Send + Sync {
    /// Get the node type name (e.g., "message", "question").
    fn node_type(&self) -> &str;

    /// Validate one node of this type at save time: config shape and
    /// outgoing-edge arity. Reference existence is the validator's job.
    fn validate(&self, node: &FlowNode) -> Result<()>;

    /// Run one visit of this node within a turn.
    fn execute(&self, node: &FlowNode, turn: &mut Turn) -> Result<NodeAction>;

    /// Branch targets carried in config, beyond `next_node_ids`.
    fn branch_targets(&self, node: &FlowNode) -> Vec<String> {
        let _ = node;
        Vec::new()
    }

    /// Get a description of this node type.
    fn description(&self) -> &str {
        "A flow node"
    }
}
