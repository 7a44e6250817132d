//! Policy load errors.

use verity_core::{CanonicalError, Classify, ErrorKind};

/// Errors raised while loading a policy bundle
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// Bundle declares a schema version this engine does not understand
    #[error("policy schema mismatch: bundle declares version {found:?}, engine supports {supported}")]
    SchemaMismatch { found: Option<u64>, supported: u64 },
    /// Bundle does not conform to the bundle JSON Schema
    #[error("policy bundle violates schema: {}", .0.join("; "))]
    SchemaViolation(Vec<String>),
    /// Two rules share an evaluation order
    #[error("rules {first:?} and {second:?} share evaluation_order {order}")]
    DuplicateEvaluationOrder {
        order: i64,
        first: String,
        second: String,
    },
    /// Two rules share an id
    #[error("duplicate rule id {0:?}")]
    DuplicateRuleId(String),
    /// A `matches` pattern does not compile
    #[error("rule {rule_id:?} has invalid pattern {pattern:?}: {reason}")]
    InvalidPattern {
        rule_id: String,
        pattern: String,
        reason: String,
    },
    /// Bundle text is not JSON or does not deserialize
    #[error("policy bundle parse error: {0}")]
    Parse(String),
    /// Bundle could not be content-addressed
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

impl Classify for PolicyError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::SchemaMismatch { .. } => ErrorKind::VersionMismatch,
            _ => ErrorKind::Invalid,
        }
    }
}
