//! Lenient handling of tool results and tool schemas.

mod errors;
mod schema;

pub use errors::{ErrorDetector, FlagProbe, MessageProbe, TOOL_ERROR_PLACEHOLDER};
pub use schema::{SchemaValidator, SchemaVerdict};

use serde_json::Value;

/// First text found in tool-result content.
///
/// Content may be a bare string, an array of `{type, text}` items (the first
/// non-empty text wins) or an object with a `text` field.
pub fn extract_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(|item| {
            item.get("text")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        }),
        Value::Object(obj) => obj
            .get("text")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}
