//! Field and schema types describing the structured output a phase expects.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Expected JSON type of an extracted field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    /// Homogeneous list
    List(Box<FieldType>),
    /// Nested object
    Object(Vec<FieldSpec>),
    /// String restricted to the listed values
    Enum(Vec<String>),
}

impl FieldType {
    pub fn list(inner: FieldType) -> Self {
        Self::List(Box::new(inner))
    }

    pub fn object(fields: Vec<FieldSpec>) -> Self {
        Self::Object(fields)
    }

    pub fn enum_of(values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::Enum(values.into_iter().map(Into::into).collect())
    }

    /// Short type name used in prompts and error messages.
    pub fn hint(&self) -> String {
        match self {
            Self::String => "string".to_string(),
            Self::Integer => "integer".to_string(),
            Self::Float => "number".to_string(),
            Self::Boolean => "boolean".to_string(),
            Self::List(inner) => format!("list[{}]", inner.hint()),
            Self::Object(_) => "object".to_string(),
            Self::Enum(values) => values.join("|"),
        }
    }

    /// Placeholder value shown to the model in the expected JSON shape.
    pub fn placeholder(&self) -> Value {
        match self {
            Self::List(inner) => Value::Array(vec![inner.placeholder()]),
            Self::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|f| (f.name.clone(), f.field_type.placeholder()))
                    .collect(),
            ),
            Self::Enum(values) => Value::String(values.join("|")),
            other => Value::String(format!("<{}>", other.hint())),
        }
    }
}

/// One field of an extraction schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    /// Shown to the model next to the field
    pub description: String,
    pub required: bool,
    /// Filled in when the model omits an optional field
    pub default: Option<Value>,
}

impl FieldSpec {
    /// A required field.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            description: String::new(),
            required: true,
            default: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Make the field optional with a default value.
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self.required = false;
        self
    }

    fn prompt_line(&self) -> String {
        let optional = if self.required { "" } else { ", optional" };
        if self.description.is_empty() {
            format!("- {} ({}{optional})", self.name, self.field_type.hint())
        } else {
            format!(
                "- {} ({}{optional}): {}",
                self.name,
                self.field_type.hint(),
                self.description
            )
        }
    }
}

/// Named set of fields a completion must fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSchema {
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

impl ExtractionSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    /// Instructions appended to the system prompt describing the JSON reply.
    pub fn to_prompt(&self) -> String {
        let template: Map<String, Value> = self
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.field_type.placeholder()))
            .collect();
        let template =
            serde_json::to_string_pretty(&Value::Object(template)).unwrap_or_default();
        let lines: Vec<String> = self.fields.iter().map(FieldSpec::prompt_line).collect();

        format!(
            "Reply with a single JSON object ({}) in a ```json block:\n```json\n{template}\n```\nFields:\n{}",
            self.name,
            lines.join("\n")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn citation_schema() -> ExtractionSchema {
        ExtractionSchema::new("citations").field(
            FieldSpec::new(
                "citations",
                FieldType::list(FieldType::object(vec![
                    FieldSpec::new("key", FieldType::String),
                    FieldSpec::new("year", FieldType::Integer).optional(),
                ])),
            )
            .with_description("Every work the text cites"),
        )
    }

    #[test]
    fn test_hints() {
        assert_eq!(FieldType::list(FieldType::String).hint(), "list[string]");
        assert_eq!(FieldType::enum_of(["journal", "book"]).hint(), "journal|book");
        assert_eq!(FieldType::Float.hint(), "number");
    }

    #[test]
    fn test_placeholder_shape() {
        let schema = citation_schema();
        assert_eq!(
            schema.fields[0].field_type.placeholder(),
            json!([{"key": "<string>", "year": "<integer>"}])
        );
    }

    #[test]
    fn test_prompt_mentions_fields() {
        let prompt = citation_schema().to_prompt();
        assert!(prompt.contains("```json"));
        assert!(prompt.contains("- citations (list[object]): Every work the text cites"));
        assert!(prompt.contains("\"key\": \"<string>\""));
    }

    #[test]
    fn test_default_makes_optional() {
        let field = FieldSpec::new("limit", FieldType::Integer).with_default(10);
        assert!(!field.required);
        assert_eq!(field.default, Some(json!(10)));
    }

    #[test]
    fn test_schema_serialization() {
        let schema = citation_schema();
        let json = serde_json::to_string(&schema).unwrap();
        let restored: ExtractionSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, schema);
    }
}
