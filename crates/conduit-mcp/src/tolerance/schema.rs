//! Weak acceptance check for tool input schemas.
//!
//! A schema is rejected only when it is missing or cannot be encoded as JSON.
//! Structural oddities are logged and accepted so one server's quirks never
//! hide its otherwise usable tools.

use serde::Serialize;
use serde_json::Value;

/// Keywords that mark a schema as using references or combinators.
const ADVANCED_KEYWORDS: &[&str] = &["$defs", "$ref", "definitions", "oneOf", "anyOf"];

/// Outcome of a schema check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaVerdict {
    Accepted,
    /// Usable, with the listed structural oddities.
    AcceptedWithWarnings(Vec<String>),
    Rejected(String),
}

impl SchemaVerdict {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Lenient tool-schema validator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl SchemaValidator {
    pub fn new() -> Self {
        Self
    }

    /// Check a schema without logging.
    pub fn check(&self, schema: Option<&Value>) -> SchemaVerdict {
        let schema = match schema {
            None | Some(Value::Null) => return SchemaVerdict::Rejected("schema is missing".into()),
            Some(s) => s,
        };

        let Value::Object(obj) = schema else {
            return SchemaVerdict::AcceptedWithWarnings(vec![format!(
                "schema is not an object: {}",
                type_name(schema)
            )]);
        };

        let mut warnings = Vec::new();
        if let Some(ty) = obj.get("type") {
            if !matches!(ty, Value::String(_) | Value::Array(_)) {
                warnings.push(format!(
                    "`type` should be a string or array, found {}",
                    type_name(ty)
                ));
            }
        }
        if let Some(props) = obj.get("properties") {
            if !props.is_object() {
                warnings.push(format!(
                    "`properties` should be an object, found {}",
                    type_name(props)
                ));
            }
        }

        if warnings.is_empty() {
            SchemaVerdict::Accepted
        } else {
            SchemaVerdict::AcceptedWithWarnings(warnings)
        }
    }

    /// Whether a tool's schema is good enough to list the tool.
    pub fn should_accept(&self, tool: &str, schema: Option<&Value>) -> bool {
        let verdict = self.check(schema);
        match &verdict {
            SchemaVerdict::Accepted => {}
            SchemaVerdict::AcceptedWithWarnings(warnings) => {
                for warning in warnings {
                    tracing::warn!(tool, warning = %warning, "Accepting tool schema with quirks");
                }
            }
            SchemaVerdict::Rejected(reason) => {
                tracing::warn!(tool, reason = %reason, "Rejecting tool schema");
            }
        }
        if let Some(schema) = schema {
            self.log_schema(tool, schema);
        }
        verdict.is_accepted()
    }

    /// Accept any schema value that encodes to JSON.
    pub fn accept_serializable<S: Serialize + ?Sized>(&self, tool: &str, schema: &S) -> bool {
        match serde_json::to_value(schema) {
            Ok(value) => self.should_accept(tool, Some(&value)),
            Err(e) => {
                tracing::warn!(tool, error = %e, "Rejecting tool schema that cannot be encoded");
                false
            }
        }
    }

    /// Debug-log the advanced keywords a schema uses.
    pub fn log_schema(&self, tool: &str, schema: &Value) {
        let Some(obj) = schema.as_object() else {
            return;
        };
        for keyword in ADVANCED_KEYWORDS.iter().filter(|k| obj.contains_key(**k)) {
            tracing::debug!(tool, keyword, "Tool schema uses advanced keyword");
        }
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_well_formed_schema_accepted() {
        let schema = json!({"type": "object", "properties": {"x": {"type": "string"}}});
        let validator = SchemaValidator::new();
        assert_eq!(validator.check(Some(&schema)), SchemaVerdict::Accepted);
        assert!(validator.should_accept("t", Some(&schema)));
    }

    #[test]
    fn test_missing_schema_rejected() {
        let validator = SchemaValidator::new();
        assert!(!validator.should_accept("t", None));
        assert!(!validator.should_accept("t", Some(&Value::Null)));
    }

    #[test]
    fn test_numeric_type_accepted_with_warning() {
        let schema = json!({"type": 42});
        let verdict = SchemaValidator::new().check(Some(&schema));
        match &verdict {
            SchemaVerdict::AcceptedWithWarnings(w) => {
                assert_eq!(w.len(), 1);
                assert!(w[0].contains("number"));
            }
            other => panic!("unexpected verdict: {other:?}"),
        }
        assert!(verdict.is_accepted());
        assert!(SchemaValidator::new().should_accept("t", Some(&schema)));
    }

    #[test]
    fn test_other_quirks_accepted() {
        let validator = SchemaValidator::new();
        for schema in [
            json!({"type": "object", "properties": "x"}),
            json!({"type": ["object", "null"]}),
            json!("not an object"),
            json!({"$defs": {"a": {}}, "oneOf": [{"$ref": "#/$defs/a"}]}),
        ] {
            assert!(validator.should_accept("t", Some(&schema)), "{schema}");
        }
    }

    #[test]
    fn test_unserializable_rejected() {
        let validator = SchemaValidator::new();
        let mut schema = HashMap::new();
        schema.insert(vec![1u8], "keys must be strings");
        assert!(!validator.accept_serializable("t", &schema));
        assert!(validator.accept_serializable("t", &json!({"type": "object"})));
    }
}
