//! Flow definition, parsing, and validation.
//!
//! Flows are defined in JSON or YAML and consist of:
//! - A designated start node
//! - Typed nodes (start, message, question, condition, end)
//! - String-id edges between them

mod parser;
mod types;
mod validator;

pub use parser::{parse_flow, parse_flow_file};
pub use types::{FlowDefinition, FlowNode};
pub use validator::validate_flow;
