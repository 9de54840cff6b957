//! Flow definition types.
//!
//! A flow is a directed graph of typed nodes describing one side of a
//! messaging conversation. Nodes reference each other by string id; the
//! graph is an arena, never pointers.

use serde::{Deserialize, Serialize};

/// A complete conversation flow definition.
///
/// # Example YAML
///
/// ```yaml
/// name: onboarding
/// organization_id: org-1
/// start_node_id: hello
///
/// nodes:
///   - id: hello
///     type: start
///     next_node_ids: [greet]
///   - id: greet
///     type: message
///     config:
///       text: "Hi {{name}}!"
///     next_node_ids: [done]
///   - id: done
///     type: end
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Unique flow name within the owning organization
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Version number (definitions are immutable per version; running
    /// executions keep the snapshot they started with)
    #[serde(default = "default_version")]
    pub version: u32,

    /// Owning organization
    pub organization_id: String,

    /// Entry node id; must name a `start` node
    pub start_node_id: String,

    /// Nodes (steps) in the flow
    pub nodes: Vec<FlowNode>,
}

fn default_version() -> u32 {
    1
}

/// A node (step) in the flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNode {
    /// Unique node ID within this flow
    pub id: String,

    /// Node type (start, message, question, condition, end)
    #[serde(rename = "type")]
    pub node_type: String,

    /// Node-specific configuration
    #[serde(default)]
    pub config: serde_json::Value,

    /// Outgoing edges. Linear node types carry exactly one entry;
    /// `condition` branches live in its config, `end` has none.
    #[serde(default)]
    pub next_node_ids: Vec<String>,
}

impl FlowNode {
    /// The single outgoing edge of a linear node, if present.
    pub fn single_next(&self) -> Option<&str> {
        match self.next_node_ids.as_slice() {
            [next] => Some(next.as_str()),
            _ => None,
        }
    }
}

impl FlowDefinition {
    /// Get a node by ID.
    pub fn get_node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Get all node types used in this flow.
    pub fn node_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.nodes.iter().map(|n| n.node_type.as_str()).collect();
        types.sort();
        types.dedup();
        types
    }
}
