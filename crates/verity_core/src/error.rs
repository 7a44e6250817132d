//! Core error types and the fabric-wide error taxonomy.

use crate::canonical::CanonicalError;
use crate::hash::HashError;
use crate::version::VersionError;
use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Error classes shared by every crate in the fabric.
///
/// Callers branch on the class, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A policy rule denied the action
    PolicyDenied,
    /// Replay produced a different result than the recorded run
    ReplayDiverged,
    /// Merkle root, proof or content identifier mismatch
    IntegrityFailure,
    /// Engine or policy version differs from the one required
    VersionMismatch,
    /// A peer refused a delegation for identity, depth, snapshot or integrity reasons
    DelegationRejected,
    /// Circuit breaker is open for the peer
    CircuitOpen,
    /// Timeout or connection failure that may succeed on retry
    Transient,
    /// Requested item does not exist
    NotFound,
    /// Malformed input
    Invalid,
    /// Unexpected failure
    Internal,
}

impl ErrorKind {
    /// Whether local retry with backoff is permitted for this class
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Stable name for structured output
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyDenied => "policy_denied",
            Self::ReplayDiverged => "replay_diverged",
            Self::IntegrityFailure => "integrity_failure",
            Self::VersionMismatch => "version_mismatch",
            Self::DelegationRejected => "delegation_rejected",
            Self::CircuitOpen => "circuit_open",
            Self::Transient => "transient",
            Self::NotFound => "not_found",
            Self::Invalid => "invalid",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that belong to a taxonomy class
pub trait Classify {
    /// Class of this error
    fn kind(&self) -> ErrorKind;

    /// Whether local retry is permitted
    fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Canonical encoding failed
    Canonical(CanonicalError),

    /// Malformed digest
    Hash(HashError),

    /// Malformed version
    Version(VersionError),

    /// Hash mismatch
    HashMismatch { expected: String, actual: String },

    /// Validation error
    Validation { field: String, reason: String },

    /// Not found
    NotFound { kind: String, id: String },

    /// Timeout
    Timeout {
        /// Operation that timed out
        operation: String,
    },

    /// Internal error (for unexpected errors)
    Internal {
        /// Error message
        message: String,
    },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canonical(err) => write!(f, "Canonical encoding failed: {}", err),
            Self::Hash(err) => write!(f, "Invalid digest: {}", err),
            Self::Version(err) => write!(f, "Invalid version: {}", err),
            Self::HashMismatch { expected, actual } => {
                write!(f, "Hash mismatch: expected {}, got {}", expected, actual)
            }
            Self::Validation { field, reason } => {
                write!(f, "Validation failed for {}: {}", field, reason)
            }
            Self::NotFound { kind, id } => write!(f, "{} not found: {}", kind, id),
            Self::Timeout { operation } => write!(f, "Timeout: {}", operation),
            Self::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for CoreError {}

impl Classify for CoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Canonical(_) | Self::Hash(_) | Self::Version(_) | Self::Validation { .. } => {
                ErrorKind::Invalid
            }
            Self::HashMismatch { .. } => ErrorKind::IntegrityFailure,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Timeout { .. } => ErrorKind::Transient,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }
}

impl From<CanonicalError> for CoreError {
    fn from(err: CanonicalError) -> Self {
        Self::Canonical(err)
    }
}

impl From<HashError> for CoreError {
    fn from(err: HashError) -> Self {
        Self::Hash(err)
    }
}

impl From<VersionError> for CoreError {
    fn from(err: VersionError) -> Self {
        Self::Version(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::NotFound {
            kind: "Run".to_string(),
            id: "abc".to_string(),
        };
        assert_eq!(format!("{}", err), "Run not found: abc");
    }

    #[test]
    fn test_hash_mismatch_is_integrity_failure() {
        let err = CoreError::HashMismatch {
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        let s = format!("{}", err);
        assert!(s.contains("abc123"));
        assert!(s.contains("def456"));
        assert_eq!(err.kind(), ErrorKind::IntegrityFailure);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_only_transient_is_retryable() {
        let retryable: Vec<ErrorKind> = [
            ErrorKind::PolicyDenied,
            ErrorKind::ReplayDiverged,
            ErrorKind::IntegrityFailure,
            ErrorKind::VersionMismatch,
            ErrorKind::DelegationRejected,
            ErrorKind::CircuitOpen,
            ErrorKind::Transient,
            ErrorKind::NotFound,
            ErrorKind::Invalid,
            ErrorKind::Internal,
        ]
        .into_iter()
        .filter(ErrorKind::is_retryable)
        .collect();
        assert_eq!(retryable, vec![ErrorKind::Transient]);
    }

    #[test]
    fn test_canonical_error_converts() {
        let err: CoreError = CanonicalError::FloatInDigestPath {
            path: "x".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert!(err.to_string().contains("x"));
    }
}
