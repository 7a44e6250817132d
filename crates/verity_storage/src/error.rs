//! Storage errors.

use verity_core::{Classify, ErrorKind};
use verity_log::NdjsonError;

/// Store error
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No value under the key
    #[error("key not found: {key}")]
    NotFound { key: String },
    /// Key is empty, absolute, or escapes its root
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },
    /// Value exceeds the configured limit
    #[error("value for {key} is {size} bytes (limit {limit})")]
    ValueTooLarge {
        key: String,
        size: usize,
        limit: usize,
    },
    /// A run id prefix matched more than one run
    #[error("run id prefix {prefix} is ambiguous ({matches} runs)")]
    AmbiguousRunId { prefix: String, matches: usize },
    /// Backing filesystem failed
    #[error("io error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    /// Stored JSON did not decode
    #[error("malformed value at {key}: {reason}")]
    Serialization { key: String, reason: String },
    #[error(transparent)]
    Ndjson(#[from] NdjsonError),
}

impl StoreError {
    pub(crate) fn io(key: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound {
                key: key.to_string(),
            }
        } else {
            Self::Io {
                key: key.to_string(),
                source,
            }
        }
    }

    /// Whether the key was simply absent
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Io { .. } => ErrorKind::Transient,
            Self::InvalidKey { .. }
            | Self::ValueTooLarge { .. }
            | Self::AmbiguousRunId { .. }
            | Self::Serialization { .. }
            | Self::Ndjson(_) => ErrorKind::Invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_maps_to_not_found() {
        let err = StoreError::io("runs/x", std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(err.is_not_found());
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_other_io_is_transient() {
        let err = StoreError::io(
            "runs/x",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(err.is_retryable());
    }
}
