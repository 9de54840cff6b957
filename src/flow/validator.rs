//! Flow validation.
//!
//! Everything here runs at save time. A flow that validates can still loop
//! forever by construction (cycles are legal conversation shapes); the
//! interpreter's iteration cap is the runtime guard for that.

use std::collections::HashSet;

use super::types::FlowDefinition;
use crate::error::{Error, Result};
use crate::nodes::NodeRegistry;

/// Validate a flow definition against the registered node types.
///
/// Checks for:
/// - Required fields (name, organization, nodes)
/// - Unique, non-empty node IDs
/// - A single `start` node, designated by `start_node_id`
/// - Known node types, with per-type config and edge-arity checks
/// - Every referenced node id exists (including condition branch targets)
pub fn validate_flow(flow: &FlowDefinition, registry: &NodeRegistry) -> Result<()> {
    if flow.name.is_empty() {
        return Err(Error::Validation("Flow name is required".into()));
    }

    if !flow
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Validation(
            "Flow name must contain only alphanumeric characters, hyphens, and underscores".into(),
        ));
    }

    if flow.organization_id.is_empty() {
        return Err(Error::Validation("Flow organization_id is required".into()));
    }

    if flow.nodes.is_empty() {
        return Err(Error::Validation("Flow must have at least one node".into()));
    }

    let mut ids = HashSet::new();
    for node in &flow.nodes {
        if node.id.is_empty() {
            return Err(Error::Validation("Node ID cannot be empty".into()));
        }
        if !ids.insert(node.id.as_str()) {
            return Err(Error::Validation(format!("Duplicate node ID: {}", node.id)));
        }
    }

    let start_count = flow.nodes.iter().filter(|n| n.node_type == "start").count();
    if start_count != 1 {
        return Err(Error::Validation(format!(
            "Flow must have exactly one start node, found {}",
            start_count
        )));
    }
    match flow.get_node(&flow.start_node_id) {
        Some(node) if node.node_type == "start" => {}
        Some(node) => {
            return Err(Error::Validation(format!(
                "start_node_id '{}' names a '{}' node, expected type 'start'",
                flow.start_node_id, node.node_type
            )));
        }
        None => {
            return Err(Error::Validation(format!(
                "start_node_id '{}' does not exist",
                flow.start_node_id
            )));
        }
    }

    for node in &flow.nodes {
        if node.node_type.is_empty() {
            return Err(Error::Validation(format!(
                "Node '{}' has empty type",
                node.id
            )));
        }

        let handler = registry.get(&node.node_type).ok_or_else(|| {
            Error::Validation(format!(
                "Node '{}' has unknown type '{}'",
                node.id, node.node_type
            ))
        })?;

        handler.validate(node)?;

        for target in node
            .next_node_ids
            .iter()
            .cloned()
            .chain(handler.branch_targets(node))
        {
            if !ids.contains(target.as_str()) {
                return Err(Error::Validation(format!(
                    "Node '{}' references non-existent node '{}'",
                    node.id, target
                )));
            }
        }
    }

    Ok(())
}
