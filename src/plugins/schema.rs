//! Tool argument validation against input schemas
//!
//! Input schemas are compiled once per tool into a JSON Schema validator.
//! `null` members count as absent. Paths in errors use `a.b` for nested
//! objects and `a[0]` for array items.

use super::protocol::InputSchema;
use crate::error::ToolError;
use jsonschema::error::ValidationErrorKind;
use jsonschema::Validator;
use serde_json::{Map, Value};

/// Compiled validator for one tool's arguments
pub struct ArgumentValidator {
    validator: Validator,
}

impl std::fmt::Debug for ArgumentValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArgumentValidator").finish_non_exhaustive()
    }
}

impl ArgumentValidator {
    pub fn compile(schema: &InputSchema) -> Result<Self, ToolError> {
        let document = serde_json::to_value(schema)
            .map_err(|e| ToolError::invalid("input_schema", e.to_string()))?;
        let validator = jsonschema::validator_for(&document)
            .map_err(|e| ToolError::invalid("input_schema", e.to_string()))?;
        Ok(Self { validator })
    }

    /// Validate tool arguments; `null` counts as an empty object
    pub fn validate(&self, args: &Value) -> Result<(), ToolError> {
        let args = match args {
            Value::Null => Value::Object(Map::new()),
            other => without_nulls(other),
        };
        let Some(error) = self.validator.iter_errors(&args).next() else {
            return Ok(());
        };

        let mut path = display_path(&error.instance_path.to_string());
        let reason = match &error.kind {
            ValidationErrorKind::Required { property } => {
                let name = property
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| property.to_string());
                push_name(&mut path, &name);
                "is required".to_string()
            }
            _ => error.to_string(),
        };
        if path.is_empty() {
            path.push('$');
        }
        Err(ToolError::invalid(path, reason))
    }
}

fn without_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), without_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(without_nulls).collect()),
        other => other.clone(),
    }
}

/// `/author/login` -> `author.login`, `/labels/1` -> `labels[1]`
fn display_path(pointer: &str) -> String {
    let mut path = String::new();
    for segment in pointer.split('/').skip(1) {
        let segment = segment.replace("~1", "/").replace("~0", "~");
        if segment.parse::<usize>().is_ok() {
            path.push('[');
            path.push_str(&segment);
            path.push(']');
        } else {
            push_name(&mut path, &segment);
        }
    }
    path
}

fn push_name(path: &mut String, name: &str) {
    if !path.is_empty() {
        path.push('.');
    }
    path.push_str(name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::protocol::PropertySchema;
    use serde_json::json;

    fn validate(schema: &InputSchema, args: &Value) -> Result<(), ToolError> {
        ArgumentValidator::compile(schema).unwrap().validate(args)
    }

    fn schema() -> InputSchema {
        InputSchema::object()
            .required("query", PropertySchema::string("Search text"))
            .optional(
                "order",
                PropertySchema::string("Order").one_of(&["asc", "desc"]),
            )
            .optional("limit", PropertySchema::integer("Max results"))
            .optional(
                "labels",
                PropertySchema::array(PropertySchema::string("Label"), "Labels"),
            )
            .optional(
                "author",
                PropertySchema::object("Author filter")
                    .property("login", PropertySchema::string("Login"), true),
            )
    }

    fn path_of(err: ToolError) -> String {
        match err {
            ToolError::InvalidArgument { path, .. } => path,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_valid_arguments() {
        let args = json!({
            "query": "bug",
            "order": "asc",
            "limit": 10,
            "labels": ["a", "b"],
            "author": {"login": "octocat"}
        });
        assert!(validate(&schema(), &args).is_ok());
    }

    #[test]
    fn test_missing_required() {
        let err = validate(&schema(), &json!({"limit": 1})).unwrap_err();
        assert_eq!(path_of(err), "query");

        let err = validate(&schema(), &json!({"query": null})).unwrap_err();
        assert_eq!(path_of(err), "query");
    }

    #[test]
    fn test_extra_fields_accepted() {
        let args = json!({"query": "x", "unexpected": {"deep": true}});
        assert!(validate(&schema(), &args).is_ok());
    }

    #[test]
    fn test_enum_violation() {
        let err = validate(&schema(), &json!({"query": "x", "order": "sideways"})).unwrap_err();
        match err {
            ToolError::InvalidArgument { path, reason } => {
                assert_eq!(path, "order");
                assert!(reason.contains("\"asc\""));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_type_mismatch() {
        let err = validate(&schema(), &json!({"query": 5})).unwrap_err();
        assert_eq!(path_of(err), "query");

        let err = validate(&schema(), &json!({"query": "x", "limit": 2.5})).unwrap_err();
        assert_eq!(path_of(err), "limit");
        assert!(validate(&schema(), &json!({"query": "x", "limit": 3.0})).is_ok());
    }

    #[test]
    fn test_nested_paths() {
        let err = validate(&schema(), &json!({"query": "x", "labels": ["ok", 3]})).unwrap_err();
        assert_eq!(path_of(err), "labels[1]");

        let err = validate(&schema(), &json!({"query": "x", "author": {}})).unwrap_err();
        assert_eq!(path_of(err), "author.login");
    }

    #[test]
    fn test_optional_null_is_absent() {
        assert!(validate(&schema(), &json!({"query": "x", "limit": null})).is_ok());
    }

    #[test]
    fn test_display_path() {
        assert_eq!(display_path(""), "");
        assert_eq!(display_path("/author/login"), "author.login");
        assert_eq!(display_path("/labels/1"), "labels[1]");
        assert_eq!(display_path("/a~1b"), "a/b");
    }

    #[test]
    fn test_non_object_arguments() {
        assert!(validate(&InputSchema::object(), &Value::Null).is_ok());
        let err = validate(&InputSchema::object(), &json!("text")).unwrap_err();
        assert_eq!(path_of(err), "$");
    }
}
