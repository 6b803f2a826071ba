//! Checking extracted JSON against a schema.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::schema::{FieldSpec, FieldType};

/// A single way an extracted value failed its schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum FieldError {
    Missing { path: String, expected: String },
    WrongType {
        path: String,
        expected: String,
        got: String,
    },
    NotAllowed {
        path: String,
        value: String,
        allowed: Vec<String>,
    },
    NotAnObject { got: String },
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing { path, expected } => {
                write!(f, "missing field '{path}' ({expected})")
            }
            Self::WrongType {
                path,
                expected,
                got,
            } => write!(f, "field '{path}' should be {expected}, got {got}"),
            Self::NotAllowed {
                path,
                value,
                allowed,
            } => write!(
                f,
                "field '{path}' has value '{value}', expected one of {}",
                allowed.join(", ")
            ),
            Self::NotAnObject { got } => write!(f, "expected a JSON object, got {got}"),
        }
    }
}

fn type_name(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
    .to_string()
}

/// Validate `value` as an object carrying `fields`.
///
/// Collects every problem instead of stopping at the first.
pub fn validate_fields(value: &Value, fields: &[FieldSpec]) -> Result<(), Vec<FieldError>> {
    let mut errors = Vec::new();
    check_object(value, fields, "", &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn check_object(value: &Value, fields: &[FieldSpec], prefix: &str, errors: &mut Vec<FieldError>) {
    let Some(obj) = value.as_object() else {
        if prefix.is_empty() {
            errors.push(FieldError::NotAnObject {
                got: type_name(value),
            });
        } else {
            errors.push(FieldError::WrongType {
                path: prefix.to_string(),
                expected: "object".to_string(),
                got: type_name(value),
            });
        }
        return;
    };

    for field in fields {
        let path = join_path(prefix, &field.name);
        match obj.get(&field.name) {
            // An explicit null counts as absent.
            None | Some(Value::Null) if field.required => errors.push(FieldError::Missing {
                expected: field.field_type.hint(),
                path,
            }),
            None | Some(Value::Null) => {}
            Some(v) => check_value(v, &field.field_type, &path, errors),
        }
    }
}

fn check_value(value: &Value, expected: &FieldType, path: &str, errors: &mut Vec<FieldError>) {
    let ok = match expected {
        FieldType::String => value.is_string(),
        FieldType::Integer => value.is_i64() || value.is_u64(),
        FieldType::Float => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::List(inner) => match value.as_array() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    check_value(item, inner, &format!("{path}[{i}]"), errors);
                }
                true
            }
            None => false,
        },
        FieldType::Object(fields) => {
            check_object(value, fields, path, errors);
            return;
        }
        FieldType::Enum(allowed) => match value.as_str() {
            Some(s) if allowed.iter().any(|a| a == s) => true,
            Some(s) => {
                errors.push(FieldError::NotAllowed {
                    path: path.to_string(),
                    value: s.to_string(),
                    allowed: allowed.clone(),
                });
                return;
            }
            None => false,
        },
    };
    if !ok {
        errors.push(FieldError::WrongType {
            path: path.to_string(),
            expected: expected.hint(),
            got: type_name(value),
        });
    }
}

/// Fill absent optional fields that declare a default.
pub fn apply_defaults(obj: &mut Map<String, Value>, fields: &[FieldSpec]) {
    for field in fields {
        if let Some(default) = &field.default {
            let absent = matches!(obj.get(&field.name), None | Some(Value::Null));
            if absent {
                obj.insert(field.name.clone(), default.clone());
            }
        }
    }
}
