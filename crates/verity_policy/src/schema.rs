//! Fixed JSON Schema for policy bundles.

use jsonschema::{Draft, Validator};
use once_cell::sync::Lazy;
use serde_json::{Value, json};

/// Bundle schema version understood by this engine
pub const SUPPORTED_SCHEMA_VERSION: u64 = 1;

/// JSON Schema (draft 2020-12) every bundle must satisfy
pub static BUNDLE_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "$id": "https://verity.fabric/schemas/policy-bundle.json",
        "title": "Policy bundle",
        "type": "object",
        "additionalProperties": false,
        "required": ["schema_version", "version", "name", "rules"],
        "properties": {
            "schema_version": { "type": "integer", "minimum": 1 },
            "version": { "type": "string", "minLength": 1 },
            "name": { "type": "string", "minLength": 1 },
            "rules": {
                "type": "array",
                "items": { "$ref": "#/$defs/rule" }
            }
        },
        "$defs": {
            "rule": {
                "type": "object",
                "additionalProperties": false,
                "required": [
                    "id",
                    "severity",
                    "condition",
                    "suggestion",
                    "deterministic",
                    "evaluation_order"
                ],
                "properties": {
                    "id": { "type": "string", "pattern": "^[a-z0-9][a-z0-9_.-]*$" },
                    "severity": { "enum": ["DENY", "WARN", "INFO"] },
                    "kind": {
                        "enum": ["general", "capability", "replay_integrity", "fingerprint_match"]
                    },
                    "condition": { "$ref": "#/$defs/condition" },
                    "message": { "type": ["string", "null"] },
                    "suggestion": { "type": "string" },
                    "deterministic": { "type": "boolean" },
                    "evaluation_order": { "type": "integer" }
                }
            },
            "condition": {
                "type": "object",
                "required": ["op"],
                "properties": {
                    "op": {
                        "enum": [
                            "always", "never", "eq", "ne", "in", "not_in", "contains",
                            "not_contained_in", "not_subset", "eq_field", "ne_field",
                            "exists", "missing", "gt", "ge", "lt", "le", "matches",
                            "all", "any", "not"
                        ]
                    },
                    "field": { "type": "string", "minLength": 1 },
                    "conditions": { "type": "array", "items": { "$ref": "#/$defs/condition" } },
                    "condition": { "$ref": "#/$defs/condition" }
                }
            }
        }
    })
});

static VALIDATOR: Lazy<Result<Validator, String>> = Lazy::new(|| {
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&BUNDLE_SCHEMA)
        .map_err(|e| e.to_string())
});

/// Validate a bundle document, returning every violation found
///
/// # Errors
///
/// Returns the list of violation messages
pub fn validate_bundle(document: &Value) -> Result<(), Vec<String>> {
    let validator = VALIDATOR.as_ref().map_err(|e| vec![format!("schema: {e}")])?;
    let errors: Vec<String> = validator
        .iter_errors(document)
        .map(|e| e.to_string())
        .collect();
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_compiles() {
        assert!(VALIDATOR.is_ok());
    }

    #[test]
    fn test_minimal_bundle_valid() {
        let doc = json!({
            "schema_version": 1,
            "version": "1.0.0",
            "name": "minimal",
            "rules": []
        });
        assert!(validate_bundle(&doc).is_ok());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let doc = json!({
            "schema_version": 1,
            "version": "1.0.0",
            "name": "x",
            "rules": [],
            "extra": true
        });
        assert!(validate_bundle(&doc).is_err());
    }

    #[test]
    fn test_bad_severity_rejected() {
        let doc = json!({
            "schema_version": 1,
            "version": "1.0.0",
            "name": "x",
            "rules": [{
                "id": "r1",
                "severity": "FATAL",
                "condition": {"op": "always"},
                "suggestion": "",
                "deterministic": true,
                "evaluation_order": 1
            }]
        });
        let errors = validate_bundle(&doc).unwrap_err();
        assert!(!errors.is_empty());
    }
}
