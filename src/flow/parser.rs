//! Flow definition parser (JSON or YAML).

use std::path::Path;

use super::types::FlowDefinition;
use crate::error::{Error, Result};

/// Parse a flow definition from a JSON or YAML string.
///
/// JSON is detected by a leading `{`; anything else goes through the YAML
/// parser.
pub fn parse_flow(input: &str) -> Result<FlowDefinition> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("Empty flow definition".to_string()));
    }

    if trimmed.starts_with('{') {
        serde_json::from_str(trimmed).map_err(|e| diagnose("JSON", &e.to_string()))
    } else {
        serde_yaml::from_str(trimmed).map_err(|e| diagnose("YAML", &e.to_string()))
    }
}

/// Parse a flow definition from a file path.
pub fn parse_flow_file(path: &Path) -> Result<FlowDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_flow(&content)
}

fn diagnose(format: &str, error_message: &str) -> Error {
    if let Some(field) = extract_missing_field(error_message) {
        Error::Validation(format!("Missing required field: {}", field))
    } else {
        Error::Validation(format!("Invalid {}: {}", format, error_message))
    }
}

fn extract_missing_field(error_message: &str) -> Option<&str> {
    let marker = "missing field `";
    let start = error_message.find(marker)? + marker.len();
    let rest = &error_message[start..];
    let end = rest.find('`')?;
    Some(&rest[..end])
}
