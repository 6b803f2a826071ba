//! Structured extraction from free-text completions.
//!
//! A phase that needs structured data attaches an [`ExtractionSchema`] to its
//! completion request. The schema renders the expected JSON shape into the
//! prompt, and [`ExtractionSchema::extract`] pulls the JSON back out of the
//! reply, fills defaults and validates it. Anything that cannot be turned into
//! the declared fields becomes [`Error::MalformedOutput`].

mod schema;
mod validate;

pub use schema::{ExtractionSchema, FieldSpec, FieldType};
pub use validate::{apply_defaults, validate_fields, FieldError};

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Result};

/// Locate the JSON payload in a reply that may wrap it in prose or fences.
///
/// Tries a ```json fence, then any fence, then the outermost `{...}` or
/// `[...]`. Returns the trimmed reply when nothing matches.
pub fn extract_json(reply: &str) -> &str {
    if let Some(start) = reply.find("```json") {
        let body = start + "```json".len();
        if let Some(end) = reply[body..].find("```") {
            return reply[body..body + end].trim();
        }
    }

    if let Some(start) = reply.find("```") {
        let after = start + 3;
        // Skip a language tag on the fence line.
        let body = reply[after..]
            .find('\n')
            .map(|i| after + i + 1)
            .unwrap_or(after);
        if let Some(end) = reply[body..].find("```") {
            return reply[body..body + end].trim();
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (reply.find(open), reply.rfind(close)) {
            if end > start {
                return &reply[start..=end];
            }
        }
    }

    reply.trim()
}

impl ExtractionSchema {
    /// Parse, default and validate the reply produced for `phase`.
    pub fn extract(&self, phase: &str, reply: &str) -> Result<Map<String, Value>> {
        let payload = extract_json(reply);
        let value: Value = serde_json::from_str(payload).map_err(|e| {
            debug!(phase, schema = %self.name, error = %e, "reply is not JSON");
            Error::malformed_output(phase, format!("expected JSON for {}: {e}", self.name))
        })?;

        let Value::Object(mut obj) = value else {
            return Err(Error::malformed_output(
                phase,
                format!("expected a JSON object for {}", self.name),
            ));
        };

        apply_defaults(&mut obj, &self.fields);
        let as_value = Value::Object(obj);
        validate_fields(&as_value, &self.fields).map_err(|errors| {
            let detail: Vec<String> = errors.iter().map(ToString::to_string).collect();
            Error::malformed_output(phase, detail.join("; "))
        })?;

        match as_value {
            Value::Object(obj) => Ok(obj),
            _ => Err(Error::Internal("validated value is not an object".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn thesis_schema() -> ExtractionSchema {
        ExtractionSchema::new("thesis")
            .field(FieldSpec::new("thesis", FieldType::String))
            .field(FieldSpec::new("clarified", FieldType::Boolean).with_default(false))
    }

    #[test]
    fn test_extract_json_fenced() {
        let reply = "Sure.\n```json\n{\"a\": 1}\n```\nAnything else?";
        assert_eq!(extract_json(reply), "{\"a\": 1}");
    }

    #[test]
    fn test_extract_json_generic_fence() {
        let reply = "```javascript\n{\"a\": 2}\n```";
        assert_eq!(extract_json(reply), "{\"a\": 2}");
    }

    #[test]
    fn test_extract_json_raw() {
        assert_eq!(extract_json("The answer is {\"a\": 3}."), "{\"a\": 3}");
        assert_eq!(extract_json("keys: [\"x\", \"y\"]"), "[\"x\", \"y\"]");
        assert_eq!(extract_json("  nothing here "), "nothing here");
    }

    #[test]
    fn test_extract_fills_defaults() {
        let obj = thesis_schema()
            .extract("clarify", "```json\n{\"thesis\": \"Tools shape thought\"}\n```")
            .unwrap();
        assert_eq!(obj.get("thesis"), Some(&json!("Tools shape thought")));
        assert_eq!(obj.get("clarified"), Some(&json!(false)));
    }

    #[test]
    fn test_extract_rejects_prose() {
        let err = thesis_schema()
            .extract("clarify", "I think your thesis is interesting.")
            .unwrap_err();
        assert!(matches!(err, Error::MalformedOutput { ref phase, .. } if phase == "clarify"));
    }

    #[test]
    fn test_extract_reports_field_problems() {
        let err = thesis_schema()
            .extract("clarify", "{\"thesis\": 42}")
            .unwrap_err();
        assert!(err.to_string().contains("field 'thesis' should be string"));
    }

    #[test]
    fn test_extract_rejects_arrays() {
        let err = thesis_schema().extract("extract", "[1, 2]").unwrap_err();
        assert!(err.to_string().contains("expected a JSON object"));
    }
}
