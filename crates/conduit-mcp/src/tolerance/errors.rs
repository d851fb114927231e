//! Tool-result error detection across the result shapes servers actually send.
//!
//! Detection is an ordered list of named probes; the first probe that matches
//! wins. A result no probe recognizes is treated as a success, so a server that
//! reports errors in some unknown shape is never blocked.

use serde_json::Value;

use crate::protocol::CallToolResult;

/// Message used when a result is flagged as an error but carries no readable message.
pub const TOOL_ERROR_PLACEHOLDER: &str = "MCP tool error (see nested error object)";

/// Decides whether a raw result is an error.
pub type FlagProbe = fn(&Value) -> bool;

/// Pulls an error message out of a raw result.
pub type MessageProbe = fn(&Value) -> Option<String>;

/// Ordered error-shape probes for tool results.
#[derive(Debug, Clone)]
pub struct ErrorDetector {
    flag_probes: Vec<(&'static str, FlagProbe)>,
    message_probes: Vec<(&'static str, MessageProbe)>,
}

impl Default for ErrorDetector {
    fn default() -> Self {
        Self {
            flag_probes: vec![
                ("isError", top_level_flag as FlagProbe),
                ("content.error.isError", nested_flag as FlagProbe),
                ("content.error.isError (string)", nested_string_flag as FlagProbe),
                ("isError (string)", top_level_string_flag as FlagProbe),
                ("error.isError", error_object_flag as FlagProbe),
            ],
            message_probes: vec![
                ("error", top_level_message as MessageProbe),
                ("error.message", error_object_message as MessageProbe),
                ("content.error.message", nested_message as MessageProbe),
            ],
        }
    }
}

fn top_level_flag(v: &Value) -> bool {
    is_true(v.get("isError"))
}

fn nested_flag(v: &Value) -> bool {
    is_true(v.pointer("/content/error/isError"))
}

fn nested_string_flag(v: &Value) -> bool {
    is_true_string(v.pointer("/content/error/isError"))
}

fn top_level_string_flag(v: &Value) -> bool {
    is_true_string(v.get("isError"))
}

fn error_object_flag(v: &Value) -> bool {
    let flag = v.pointer("/error/isError");
    is_true(flag) || is_true_string(flag)
}

fn top_level_message(v: &Value) -> Option<String> {
    non_empty_str(v.get("error"))
}

fn error_object_message(v: &Value) -> Option<String> {
    non_empty_str(v.pointer("/error/message")).or_else(|| non_empty_str(v.pointer("/error/error")))
}

fn nested_message(v: &Value) -> Option<String> {
    non_empty_str(v.pointer("/content/error/message"))
        .or_else(|| non_empty_str(v.pointer("/content/error/error")))
}

impl ErrorDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a flag probe, consulted after the built-in ones.
    pub fn with_flag_probe(mut self, name: &'static str, probe: FlagProbe) -> Self {
        self.flag_probes.push((name, probe));
        self
    }

    /// Append a message probe, consulted after the built-in ones.
    pub fn with_message_probe(mut self, name: &'static str, probe: MessageProbe) -> Self {
        self.message_probes.push((name, probe));
        self
    }

    /// Name of the first flag probe that matches, if any.
    pub fn matching_probe(&self, result: &Value) -> Option<&'static str> {
        self.flag_probes
            .iter()
            .find(|(_, probe)| probe(result))
            .map(|(name, _)| *name)
    }

    /// Whether any known error shape is present.
    pub fn is_error(&self, result: &Value) -> bool {
        match self.matching_probe(result) {
            Some(probe) => {
                tracing::debug!(probe, "Tool result flagged as error");
                true
            }
            None => false,
        }
    }

    /// Human-readable message for a flagged result.
    ///
    /// Falls back to [`TOOL_ERROR_PLACEHOLDER`] when no message shape matches.
    pub fn error_message(&self, result: &Value) -> String {
        self.message_probes
            .iter()
            .find_map(|(_, probe)| probe(result))
            .unwrap_or_else(|| TOOL_ERROR_PLACEHOLDER.to_string())
    }

    /// Wrap a raw `tools/call` result.
    pub fn inspect(&self, raw: Value) -> CallToolResult {
        let is_error = self.is_error(&raw);
        let error_message = is_error.then(|| self.error_message(&raw));
        let content = raw.get("content").cloned().unwrap_or(Value::Null);
        CallToolResult {
            content,
            is_error,
            error_message,
            raw,
        }
    }
}

fn is_true(v: Option<&Value>) -> bool {
    matches!(v, Some(Value::Bool(true)))
}

fn is_true_string(v: Option<&Value>) -> bool {
    matches!(v, Some(Value::String(s)) if s == "true")
}

fn non_empty_str(v: Option<&Value>) -> Option<String> {
    v.and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_top_level_flag_with_message() {
        let detector = ErrorDetector::new();
        let result = json!({"isError": true, "error": "disk full"});
        assert!(detector.is_error(&result));
        assert_eq!(detector.error_message(&result), "disk full");
    }

    #[test]
    fn test_nested_flag_with_message() {
        let detector = ErrorDetector::new();
        let result = json!({"content": {"error": {"isError": true, "message": "bad arg"}}});
        assert!(detector.is_error(&result));
        assert_eq!(detector.error_message(&result), "bad arg");
    }

    #[test]
    fn test_nested_string_flag_uses_placeholder() {
        let detector = ErrorDetector::new();
        let result = json!({"content": {"error": {"isError": "true"}}});
        assert!(detector.is_error(&result));
        assert_eq!(
            detector.matching_probe(&result),
            Some("content.error.isError (string)")
        );
        assert_eq!(detector.error_message(&result), TOOL_ERROR_PLACEHOLDER);
    }

    #[test]
    fn test_string_flag_is_case_sensitive() {
        let detector = ErrorDetector::new();
        for flag in ["TRUE", "True", " true"] {
            assert!(!detector.is_error(&json!({"isError": flag})), "{flag}");
            assert!(!detector.is_error(&json!({"content": {"error": {"isError": flag}}})));
        }
        assert!(detector.is_error(&json!({"isError": "true"})));
    }

    #[test]
    fn test_plain_content_is_not_an_error() {
        let detector = ErrorDetector::new();
        assert!(!detector.is_error(&json!({"content": "ok"})));
        assert!(!detector.is_error(&json!({"isError": false, "content": []})));
        assert!(!detector.is_error(&json!({"content": {"error": {"isError": "false"}}})));
        assert!(!detector.is_error(&json!("just a string")));
    }

    #[test]
    fn test_first_probe_wins() {
        let detector = ErrorDetector::new();
        let result = json!({
            "isError": true,
            "content": {"error": {"isError": "true"}}
        });
        assert_eq!(detector.matching_probe(&result), Some("isError"));
    }

    #[test]
    fn test_message_probe_order() {
        let detector = ErrorDetector::new();
        let result = json!({
            "isError": true,
            "error": {"message": "outer"},
            "content": {"error": {"message": "inner"}}
        });
        assert_eq!(detector.error_message(&result), "outer");

        let result = json!({"error": {"isError": "true", "error": "legacy"}});
        assert!(detector.is_error(&result));
        assert_eq!(detector.error_message(&result), "legacy");
    }

    #[test]
    fn test_custom_probe() {
        let detector = ErrorDetector::new()
            .with_flag_probe("status", |v| v.get("status").and_then(Value::as_str) == Some("error"))
            .with_message_probe("detail", |v| {
                v.get("detail").and_then(Value::as_str).map(str::to_string)
            });
        let result = json!({"status": "error", "detail": "quota exceeded"});
        assert!(detector.is_error(&result));
        assert_eq!(detector.error_message(&result), "quota exceeded");
    }

    #[test]
    fn test_inspect() {
        let detector = ErrorDetector::new();
        let ok = detector.inspect(json!({"content": [{"type": "text", "text": "hi"}]}));
        assert!(!ok.is_error());
        assert!(ok.error_message.is_none());
        assert_eq!(ok.text().as_deref(), Some("hi"));

        let bad = detector.inspect(json!({"isError": true, "error": "disk full", "content": []}));
        assert!(bad.is_error());
        assert_eq!(bad.error_message.as_deref(), Some("disk full"));
        assert_eq!(bad.raw["error"], "disk full");
    }
}
