//! Loosely-typed process variables.

use serde_json::{Map, Value as JsonValue};

use crate::error::BridgeError;

/// String-keyed map of process variables, as exchanged with the engine.
pub type Variables = Map<String, JsonValue>;

/// Read a required, non-blank string variable.
pub fn require_str<'a>(vars: &'a Variables, name: &str) -> Result<&'a str, BridgeError> {
    match vars.get(name) {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
        Some(JsonValue::String(_)) => Err(BridgeError::validation(format!(
            "process variable '{name}' is blank"
        ))),
        Some(other) => Err(BridgeError::validation(format!(
            "process variable '{name}' must be a string, got {}",
            type_name(other)
        ))),
        None => Err(BridgeError::validation(format!(
            "process variable '{name}' is required"
        ))),
    }
}

/// Read an optional string variable; blank strings count as absent.
pub fn optional_str<'a>(vars: &'a Variables, name: &str) -> Option<&'a str> {
    vars.get(name)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
