//! `{{variable}}` interpolation for node text.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::Value;
use tracing::debug;

/// Regex matching variable tokens: {{ name }}
fn token_regex() -> &'static Regex {
    static TOKEN_REGEX: OnceLock<Regex> = OnceLock::new();
    TOKEN_REGEX.get_or_init(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("valid regex"))
}

/// Render a template against conversation variables.
///
/// Unresolved variables render as the empty string. Rendering never fails;
/// a broken token is a content problem, not a run stopper.
pub fn render_text(template: &str, variables: &HashMap<String, Value>) -> String {
    token_regex()
        .replace_all(template, |caps: &regex_lite::Captures| {
            let name = &caps[1];
            match variables.get(name) {
                Some(value) => value_to_string(value),
                None => {
                    debug!(variable = name, "unresolved template variable");
                    String::new()
                }
            }
        })
        .to_string()
}

/// Convert a JSON value to its message-text form.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        _ => value.to_string(),
    }
}
