//! Policy bundles.
//!
//! A [`PolicyBundle`] is plain data. Loading validates it and produces a
//! [`CompiledBundle`]: rules sorted by `evaluation_order`, patterns
//! compiled, and the bundle's content address computed. A compiled bundle
//! is immutable and is what runs pin.

use crate::condition::Condition;
use crate::error::PolicyError;
use crate::schema::{SUPPORTED_SCHEMA_VERSION, validate_bundle};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use verity_core::{CanonicalEncode, Digest};

/// Rule severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Blocks when the condition holds
    Deny,
    /// Annotates, never blocks
    Warn,
    /// Annotates, never blocks
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Deny => "DENY",
            Self::Warn => "WARN",
            Self::Info => "INFO",
        })
    }
}

/// Which gates consider a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Pre-execution only
    #[default]
    General,
    /// Capability allowlist, checked on every tool call
    Capability,
    /// Checked after execution against the replay outcome
    ReplayIntegrity,
    /// Checked during replay against the recorded fingerprint
    FingerprintMatch,
}

/// A single policy rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub severity: Severity,
    #[serde(default)]
    pub kind: RuleKind,
    pub condition: Condition,
    #[serde(default)]
    pub message: Option<String>,
    pub suggestion: String,
    /// Non-deterministic rules may read wall-clock-derived fields; their
    /// outcomes never reach a fingerprint
    pub deterministic: bool,
    pub evaluation_order: i64,
}

impl Rule {
    /// Create a deterministic rule with an empty suggestion
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        severity: Severity,
        evaluation_order: i64,
        condition: Condition,
    ) -> Self {
        Self {
            id: id.into(),
            severity,
            kind: RuleKind::General,
            condition,
            message: None,
            suggestion: String::new(),
            deterministic: true,
            evaluation_order,
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: RuleKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = suggestion.into();
        self
    }

    #[must_use]
    pub fn non_deterministic(mut self) -> Self {
        self.deterministic = false;
        self
    }

    /// Message reported when the rule fires
    #[must_use]
    pub fn display_message(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| format!("rule {} matched", self.id))
    }
}

/// Policy bundle as authored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyBundle {
    pub schema_version: u64,
    pub version: String,
    pub name: String,
    pub rules: Vec<Rule>,
}

impl CanonicalEncode for PolicyBundle {}

impl PolicyBundle {
    /// Create an empty bundle at the supported schema version
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            schema_version: SUPPORTED_SCHEMA_VERSION,
            version: version.into(),
            name: name.into(),
            rules: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Parse and load a bundle from JSON text
    ///
    /// # Errors
    ///
    /// Returns error if the text is not a valid bundle
    pub fn load_json(text: &str) -> Result<CompiledBundle, PolicyError> {
        let document: Value =
            serde_json::from_str(text).map_err(|e| PolicyError::Parse(e.to_string()))?;
        Self::load_value(&document)
    }

    /// Load a bundle from a JSON document.
    ///
    /// The schema version is checked before anything else so an unknown
    /// version reports as a mismatch rather than a schema violation.
    ///
    /// # Errors
    ///
    /// Returns error if the document is not a valid bundle
    pub fn load_value(document: &Value) -> Result<CompiledBundle, PolicyError> {
        let found = document.get("schema_version").and_then(Value::as_u64);
        if found != Some(SUPPORTED_SCHEMA_VERSION) {
            return Err(PolicyError::SchemaMismatch {
                found,
                supported: SUPPORTED_SCHEMA_VERSION,
            });
        }
        validate_bundle(document).map_err(PolicyError::SchemaViolation)?;
        let bundle: PolicyBundle = serde_json::from_value(document.clone())
            .map_err(|e| PolicyError::Parse(e.to_string()))?;
        bundle.compile()
    }

    /// Validate and compile a bundle built in code
    ///
    /// # Errors
    ///
    /// Returns error on duplicate orders or ids, bad patterns, or an
    /// unsupported schema version
    pub fn compile(mut self) -> Result<CompiledBundle, PolicyError> {
        if self.schema_version != SUPPORTED_SCHEMA_VERSION {
            return Err(PolicyError::SchemaMismatch {
                found: Some(self.schema_version),
                supported: SUPPORTED_SCHEMA_VERSION,
            });
        }

        let mut ids = BTreeSet::new();
        let mut orders: BTreeMap<i64, &str> = BTreeMap::new();
        for rule in &self.rules {
            if !ids.insert(rule.id.as_str()) {
                return Err(PolicyError::DuplicateRuleId(rule.id.clone()));
            }
            if let Some(first) = orders.insert(rule.evaluation_order, &rule.id) {
                return Err(PolicyError::DuplicateEvaluationOrder {
                    order: rule.evaluation_order,
                    first: first.to_string(),
                    second: rule.id.clone(),
                });
            }
        }

        let mut regexes = BTreeMap::new();
        for rule in &self.rules {
            for pattern in rule.condition.patterns() {
                if regexes.contains_key(pattern) {
                    continue;
                }
                let re = Regex::new(pattern).map_err(|e| PolicyError::InvalidPattern {
                    rule_id: rule.id.clone(),
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                })?;
                regexes.insert(pattern.to_string(), re);
            }
        }

        // Array position carries no meaning, so the content address is taken
        // over the rules in evaluation order.
        self.rules.sort_by_key(|r| r.evaluation_order);
        let policy_version = self.canonical_hash()?;

        Ok(CompiledBundle {
            bundle: self,
            policy_version,
            regexes,
        })
    }
}

/// A validated, immutable bundle with its content address
#[derive(Debug, Clone)]
pub struct CompiledBundle {
    bundle: PolicyBundle,
    policy_version: Digest,
    regexes: BTreeMap<String, Regex>,
}

impl CompiledBundle {
    /// `H(bundle)`, the value pinned into run manifests
    #[must_use]
    pub fn policy_version(&self) -> &Digest {
        &self.policy_version
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.bundle.name
    }

    #[must_use]
    pub fn bundle(&self) -> &PolicyBundle {
        &self.bundle
    }

    /// Rules in ascending evaluation order
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.bundle.rules
    }

    #[must_use]
    pub fn rule(&self, id: &str) -> Option<&Rule> {
        self.bundle.rules.iter().find(|r| r.id == id)
    }

    pub(crate) fn regexes(&self) -> &BTreeMap<String, Regex> {
        &self.regexes
    }

    /// Serialize the bundle as stored in `artifacts/policy.json`
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, PolicyError> {
        serde_json::to_string_pretty(&self.bundle).map_err(|e| PolicyError::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(id: &str, order: i64) -> Rule {
        Rule::new(id, Severity::Deny, order, Condition::Never)
    }

    #[test]
    fn test_duplicate_evaluation_order_rejected() {
        let err = PolicyBundle::new("b", "1.0.0")
            .with_rule(rule("a", 1))
            .with_rule(rule("b", 1))
            .compile()
            .unwrap_err();
        assert_eq!(
            err,
            PolicyError::DuplicateEvaluationOrder {
                order: 1,
                first: "a".to_string(),
                second: "b".to_string()
            }
        );
    }

    #[test]
    fn test_duplicate_rule_id_rejected() {
        let err = PolicyBundle::new("b", "1.0.0")
            .with_rule(rule("a", 1))
            .with_rule(rule("a", 2))
            .compile()
            .unwrap_err();
        assert_eq!(err, PolicyError::DuplicateRuleId("a".to_string()));
    }

    #[test]
    fn test_unknown_schema_version_rejected() {
        let doc = json!({"schema_version": 7, "version": "1", "name": "x", "rules": []});
        assert_eq!(
            PolicyBundle::load_value(&doc).unwrap_err(),
            PolicyError::SchemaMismatch {
                found: Some(7),
                supported: 1
            }
        );
        let doc = json!({"version": "1", "name": "x", "rules": []});
        assert!(matches!(
            PolicyBundle::load_value(&doc),
            Err(PolicyError::SchemaMismatch { found: None, .. })
        ));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let err = PolicyBundle::new("b", "1.0.0")
            .with_rule(Rule::new(
                "re",
                Severity::Warn,
                1,
                Condition::Matches {
                    field: "tool".into(),
                    pattern: "(".into(),
                },
            ))
            .compile()
            .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidPattern { .. }));
    }

    #[test]
    fn test_policy_version_ignores_rule_array_order() {
        let a = PolicyBundle::new("b", "1.0.0")
            .with_rule(rule("x", 1))
            .with_rule(rule("y", 2))
            .compile()
            .unwrap();
        let b = PolicyBundle::new("b", "1.0.0")
            .with_rule(rule("y", 2))
            .with_rule(rule("x", 1))
            .compile()
            .unwrap();
        assert_eq!(a.policy_version(), b.policy_version());
        assert_eq!(a.rules()[0].id, "x");
    }

    #[test]
    fn test_policy_version_changes_with_content() {
        let a = PolicyBundle::new("b", "1.0.0").with_rule(rule("x", 1)).compile().unwrap();
        let b = PolicyBundle::new("b", "1.0.0").with_rule(rule("x", 2)).compile().unwrap();
        assert_ne!(a.policy_version(), b.policy_version());
    }

    #[test]
    fn test_load_json_roundtrip_keeps_version() {
        let compiled = PolicyBundle::new("b", "1.0.0")
            .with_rule(rule("x", 1).with_message("blocked").with_suggestion("remove x"))
            .compile()
            .unwrap();
        let text = compiled.to_json().unwrap();
        let reloaded = PolicyBundle::load_json(&text).unwrap();
        assert_eq!(reloaded.policy_version(), compiled.policy_version());
    }

    #[test]
    fn test_schema_violation_reported() {
        let doc = json!({"schema_version": 1, "version": "1", "name": "", "rules": []});
        assert!(matches!(
            PolicyBundle::load_value(&doc),
            Err(PolicyError::SchemaViolation(_))
        ));
    }
}
