//! Extraction of a structured payload from free-form generation output.
//!
//! Language models asked to "respond only in JSON" routinely wrap the JSON in
//! prose. [`ResultExtractor`] locates the first balanced top-level `{ ... }`
//! span, decodes it, and runs an optional caller-supplied schema validator.
//!
//! Known limitation: only the first top-level span is considered. Output that
//! carries several JSON objects side by side yields the first one.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Caller-supplied schema check run after a successful decode.
pub type SchemaValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionError {
    #[error("no structured payload found in backend output")]
    NoStructureFound,

    #[error("structured payload could not be decoded: {details}")]
    MalformedStructure { details: String },

    #[error("structured payload does not match the expected schema: {details}")]
    SchemaMismatch { details: String },
}

/// Returns the first balanced top-level brace-delimited span of `raw`.
///
/// The span starts at the first `{` and ends at its depth-matching `}`.
/// Inside the span, JSON string literals (with `\` escapes) are skipped so
/// braces within string values never affect the depth.
pub fn find_structured_span(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in raw[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(&raw[start..end]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Decodes and validates the structured payload embedded in generation output.
#[derive(Clone, Default)]
pub struct ResultExtractor {
    validator: Option<SchemaValidator>,
}

impl fmt::Debug for ResultExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultExtractor")
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl ResultExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a default validator, applied when a job brings none of its own.
    pub fn with_validator(
        mut self,
        validator: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn extract(&self, raw: &str) -> Result<Value, ExtractionError> {
        self.extract_with(raw, None)
    }

    /// Like [`Self::extract`], but `validator` (when given) replaces the
    /// extractor's default one.
    pub fn extract_with(
        &self,
        raw: &str,
        validator: Option<&SchemaValidator>,
    ) -> Result<Value, ExtractionError> {
        let span = find_structured_span(raw).ok_or(ExtractionError::NoStructureFound)?;

        let value: Value =
            serde_json::from_str(span).map_err(|e| ExtractionError::MalformedStructure {
                details: e.to_string(),
            })?;

        if let Some(validate) = validator.or(self.validator.as_ref()) {
            validate(&value).map_err(|details| ExtractionError::SchemaMismatch { details })?;
        }

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_object_wrapped_in_prose() {
        let raw = "Sure! {\"q\":\"2+2\", \"opts\":[1,2,3,4]} done";
        let value = ResultExtractor::new().extract(raw).unwrap();
        assert_eq!(value, json!({ "q": "2+2", "opts": [1, 2, 3, 4] }));
    }

    #[test]
    fn text_without_braces_has_no_structure() {
        let err = ResultExtractor::new()
            .extract("I could not come up with any questions.")
            .unwrap_err();
        assert_eq!(err, ExtractionError::NoStructureFound);
    }

    #[test]
    fn empty_output_has_no_structure() {
        assert_eq!(
            ResultExtractor::new().extract("").unwrap_err(),
            ExtractionError::NoStructureFound
        );
    }

    #[test]
    fn braces_inside_strings_do_not_truncate_the_span() {
        let raw = "{ \"a\": \"{nested}\" }";
        assert_eq!(find_structured_span(raw), Some(raw));
        assert_eq!(
            ResultExtractor::new().extract(raw).unwrap(),
            json!({ "a": "{nested}" })
        );
    }

    #[test]
    fn unbalanced_brace_inside_string_is_ignored() {
        let raw = r#"Here: {"answer": "a } b", "escaped": "say \"}\""} trailing"#;
        let value = ResultExtractor::new().extract(raw).unwrap();
        assert_eq!(value["answer"], "a } b");
        assert_eq!(value["escaped"], "say \"}\"");
    }

    #[test]
    fn only_first_top_level_span_is_used() {
        let raw = "{\"first\": 1} and then {\"second\": 2}";
        assert_eq!(
            ResultExtractor::new().extract(raw).unwrap(),
            json!({ "first": 1 })
        );
    }

    #[test]
    fn nested_objects_are_kept_whole() {
        let raw = "result:\n{\"mcqs\": [{\"question\": \"q\", \"meta\": {\"n\": 1}}]}\nthanks";
        let value = ResultExtractor::new().extract(raw).unwrap();
        assert_eq!(value["mcqs"][0]["meta"]["n"], 1);
    }

    #[test]
    fn unclosed_span_has_no_structure() {
        let err = ResultExtractor::new()
            .extract("{\"q\": [1, 2")
            .unwrap_err();
        assert_eq!(err, ExtractionError::NoStructureFound);
    }

    #[test]
    fn invalid_json_is_malformed() {
        let err = ResultExtractor::new()
            .extract("{question: 'single quotes'}")
            .unwrap_err();
        assert!(matches!(err, ExtractionError::MalformedStructure { .. }));
    }

    #[test]
    fn validator_failure_is_schema_mismatch() {
        let extractor = ResultExtractor::new().with_validator(|value| {
            value
                .get("mcqs")
                .map(|_| ())
                .ok_or_else(|| "missing field `mcqs`".to_owned())
        });

        assert!(extractor.extract("{\"mcqs\": []}").is_ok());
        assert_eq!(
            extractor.extract("{\"questions\": []}").unwrap_err(),
            ExtractionError::SchemaMismatch {
                details: "missing field `mcqs`".into()
            }
        );
    }

    #[test]
    fn per_call_validator_overrides_default() {
        let extractor = ResultExtractor::new().with_validator(|_| Err("default".into()));
        let permissive: SchemaValidator = Arc::new(|_| Ok(()));

        assert!(extractor.extract("{}").is_err());
        assert!(extractor.extract_with("{}", Some(&permissive)).is_ok());
    }
}
