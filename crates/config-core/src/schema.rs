//! Multi-draft meta-schema validation of values vs schemas.
//!
//! Wraps the `jsonschema` crate behind a pass/fail/reason report, in the
//! same shape as [`crate::permission`]'s and the write path's other gate
//! checks: schema enforcement lives only on the write path (§4.L), readers
//! trust stored data.

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct SchemaValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl SchemaValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn into_result(self) -> Result<(), Vec<String>> {
        if self.valid {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

/// Validate `value` against `schema` using whichever JSON Schema draft the
/// schema's `$schema` keyword declares (`jsonschema` auto-detects it).
/// A malformed schema is itself reported as a single validation error
/// rather than panicking — schema authoring mistakes are a `BadRequest`,
/// not a server error.
pub fn validate_value(value: &Value, schema: &Value) -> SchemaValidationResult {
    let compiled = match jsonschema::validator_for(schema) {
        Ok(c) => c,
        Err(e) => {
            return SchemaValidationResult {
                valid: false,
                errors: vec![format!("invalid schema: {e}")],
            }
        }
    };

    let errors: Vec<String> = compiled.iter_errors(value).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        SchemaValidationResult::ok()
    } else {
        SchemaValidationResult {
            valid: false,
            errors,
        }
    }
}
