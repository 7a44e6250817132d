//! Rule conditions and the context they are evaluated against.
//!
//! Fields are dotted paths into the context document. A numeric segment
//! indexes into an array. A comparison against a field that is absent never
//! fires; only [`Condition::Missing`] observes absence.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use verity_core::{CanonicalError, Canonicalizer};

/// Condition expression, tagged by `op`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Always,
    Never,
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    NotIn { field: String, values: Vec<Value> },
    /// The array at `field` contains `value`
    Contains { field: String, value: Value },
    /// The value at `field` is not an element of the array at `list`.
    /// An absent or non-array `list` counts as empty.
    NotContainedIn { field: String, list: String },
    /// Some element of the array at `field` is not in the array at `of`
    NotSubset { field: String, of: String },
    EqField { field: String, other: String },
    NeField { field: String, other: String },
    Exists { field: String },
    Missing { field: String },
    Gt { field: String, value: i64 },
    Ge { field: String, value: i64 },
    Lt { field: String, value: i64 },
    Le { field: String, value: i64 },
    /// String at `field` matches a regular expression
    Matches { field: String, pattern: String },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

impl Condition {
    /// Every regex pattern used in this condition tree
    pub fn patterns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_patterns(&mut out);
        out
    }

    fn collect_patterns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Matches { pattern, .. } => out.push(pattern),
            Self::All { conditions } | Self::Any { conditions } => {
                for c in conditions {
                    c.collect_patterns(out);
                }
            }
            Self::Not { condition } => condition.collect_patterns(out),
            _ => {}
        }
    }

    /// Evaluate against a context. `regexes` must hold every pattern from
    /// [`Condition::patterns`]; an uncompiled pattern never matches.
    #[must_use]
    pub fn eval(&self, ctx: &PolicyContext, regexes: &BTreeMap<String, Regex>) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Eq { field, value } => ctx.lookup(field).is_some_and(|v| v == value),
            Self::Ne { field, value } => ctx.lookup(field).is_some_and(|v| v != value),
            Self::In { field, values } => ctx.lookup(field).is_some_and(|v| values.contains(v)),
            Self::NotIn { field, values } => {
                ctx.lookup(field).is_some_and(|v| !values.contains(v))
            }
            Self::Contains { field, value } => ctx
                .lookup(field)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(value)),
            Self::NotContainedIn { field, list } => match ctx.lookup(field) {
                Some(v) => !ctx.array(list).contains(v),
                None => false,
            },
            Self::NotSubset { field, of } => match ctx.lookup(field).and_then(Value::as_array) {
                Some(items) => {
                    let allowed = ctx.array(of);
                    items.iter().any(|item| !allowed.contains(item))
                }
                None => false,
            },
            Self::EqField { field, other } => match (ctx.lookup(field), ctx.lookup(other)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            Self::NeField { field, other } => match (ctx.lookup(field), ctx.lookup(other)) {
                (Some(a), Some(b)) => a != b,
                _ => false,
            },
            Self::Exists { field } => ctx.lookup(field).is_some(),
            Self::Missing { field } => ctx.lookup(field).is_none(),
            Self::Gt { field, value } => ctx.int(field).is_some_and(|n| n > *value),
            Self::Ge { field, value } => ctx.int(field).is_some_and(|n| n >= *value),
            Self::Lt { field, value } => ctx.int(field).is_some_and(|n| n < *value),
            Self::Le { field, value } => ctx.int(field).is_some_and(|n| n <= *value),
            Self::Matches { field, pattern } => {
                match (ctx.lookup(field).and_then(Value::as_str), regexes.get(pattern)) {
                    (Some(s), Some(re)) => re.is_match(s),
                    _ => false,
                }
            }
            Self::All { conditions } => conditions.iter().all(|c| c.eval(ctx, regexes)),
            Self::Any { conditions } => conditions.iter().any(|c| c.eval(ctx, regexes)),
            Self::Not { condition } => !condition.eval(ctx, regexes),
        }
    }
}

/// Canonical document a policy is evaluated against
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyContext(Value);

impl PolicyContext {
    /// Wrap a canonical JSON document
    ///
    /// # Errors
    ///
    /// Returns error if the document contains a float
    pub fn new(value: Value) -> Result<Self, CanonicalError> {
        Canonicalizer::new().to_value(&value).map(Self)
    }

    /// Build a context from any serializable value
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be canonicalized
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, CanonicalError> {
        Canonicalizer::new().to_value(value).map(Self)
    }

    /// Add or replace a top-level field
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be canonicalized
    pub fn with<T: Serialize>(mut self, key: &str, value: &T) -> Result<Self, CanonicalError> {
        let value = Canonicalizer::new().to_value(value)?;
        if !self.0.is_object() {
            self.0 = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(map) = &mut self.0 {
            map.insert(key.to_string(), value);
        }
        Ok(self)
    }

    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Resolve a dotted path
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut current = &self.0;
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    fn int(&self, path: &str) -> Option<i64> {
        self.lookup(path).and_then(Value::as_i64)
    }

    fn array(&self, path: &str) -> &[Value] {
        self.lookup(path)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> PolicyContext {
        PolicyContext::new(value).unwrap()
    }

    fn eval(cond: &Condition, c: &PolicyContext) -> bool {
        let regexes = cond
            .patterns()
            .into_iter()
            .map(|p| (p.to_string(), Regex::new(p).unwrap()))
            .collect();
        cond.eval(c, &regexes)
    }

    #[test]
    fn test_condition_deserializes_from_op_tag() {
        let cond: Condition = serde_json::from_value(json!({
            "op": "all",
            "conditions": [
                {"op": "eq", "field": "a", "value": 1},
                {"op": "not", "condition": {"op": "exists", "field": "b"}}
            ]
        }))
        .unwrap();
        assert!(eval(&cond, &ctx(json!({"a": 1}))));
        assert!(!eval(&cond, &ctx(json!({"a": 1, "b": 2}))));
    }

    #[test]
    fn test_lookup_paths() {
        let c = ctx(json!({"pack": {"tools": ["x", "y"], "meta": {"id": "p1"}}}));
        assert_eq!(c.lookup("pack.meta.id"), Some(&json!("p1")));
        assert_eq!(c.lookup("pack.tools.1"), Some(&json!("y")));
        assert!(c.lookup("pack.tools.9").is_none());
        assert!(c.lookup("pack.meta.id.deeper").is_none());
    }

    #[test]
    fn test_absent_field_never_fires_comparisons() {
        let c = ctx(json!({}));
        for cond in [
            Condition::Eq { field: "x".into(), value: json!(1) },
            Condition::Ne { field: "x".into(), value: json!(1) },
            Condition::NotIn { field: "x".into(), values: vec![json!(1)] },
            Condition::Gt { field: "x".into(), value: 0 },
            Condition::NotContainedIn { field: "x".into(), list: "y".into() },
            Condition::NeField { field: "x".into(), other: "y".into() },
        ] {
            assert!(!eval(&cond, &c), "{cond:?} fired on empty context");
        }
        assert!(eval(&Condition::Missing { field: "x".into() }, &c));
    }

    #[test]
    fn test_not_contained_in_allowlist() {
        let cond = Condition::NotContainedIn {
            field: "tool".into(),
            list: "allowed_tools".into(),
        };
        assert!(eval(&cond, &ctx(json!({"tool": "rm", "allowed_tools": ["ls"]}))));
        assert!(!eval(&cond, &ctx(json!({"tool": "ls", "allowed_tools": ["ls"]}))));
        assert!(eval(&cond, &ctx(json!({"tool": "ls"}))));
    }

    #[test]
    fn test_not_subset() {
        let cond = Condition::NotSubset {
            field: "requested".into(),
            of: "allowed".into(),
        };
        assert!(!eval(&cond, &ctx(json!({"requested": ["a"], "allowed": ["a", "b"]}))));
        assert!(eval(&cond, &ctx(json!({"requested": ["a", "c"], "allowed": ["a", "b"]}))));
        assert!(!eval(&cond, &ctx(json!({"requested": [], "allowed": []}))));
    }

    #[test]
    fn test_integer_comparisons() {
        let c = ctx(json!({"elapsed_ms": 1500}));
        assert!(eval(&Condition::Gt { field: "elapsed_ms".into(), value: 1000 }, &c));
        assert!(eval(&Condition::Le { field: "elapsed_ms".into(), value: 1500 }, &c));
        assert!(!eval(&Condition::Lt { field: "elapsed_ms".into(), value: 1500 }, &c));
    }

    #[test]
    fn test_matches() {
        let cond = Condition::Matches {
            field: "tool".into(),
            pattern: "^fs\\.".into(),
        };
        assert!(eval(&cond, &ctx(json!({"tool": "fs.write"}))));
        assert!(!eval(&cond, &ctx(json!({"tool": "net.get"}))));
        assert!(!cond.eval(&ctx(json!({"tool": "fs.write"})), &BTreeMap::new()));
    }

    #[test]
    fn test_field_comparisons() {
        let cond = Condition::NeField {
            field: "fingerprint".into(),
            other: "expected_fingerprint".into(),
        };
        assert!(eval(&cond, &ctx(json!({"fingerprint": "a", "expected_fingerprint": "b"}))));
        assert!(!eval(&cond, &ctx(json!({"fingerprint": "a", "expected_fingerprint": "a"}))));
    }

    #[test]
    fn test_context_rejects_float() {
        assert!(PolicyContext::new(json!({"ratio": 0.5})).is_err());
    }

    #[test]
    fn test_context_with_field() {
        let c = PolicyContext::default().with("tool", &"ls").unwrap();
        assert_eq!(c.lookup("tool"), Some(&json!("ls")));
    }
}
