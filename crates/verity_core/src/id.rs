//! Identifiers for fabric entities.
//!
//! Run identifiers are content-derived and never random: the same engine
//! version, input and policy always produce the same [`RunId`].

use crate::canonical::{CanonicalError, canonical_hash};
use crate::hash::{Digest, HashError};
use crate::version::Version;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;

/// Run identifier, derived from the run's deterministic inputs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Digest);

impl RunId {
    /// Derive the id as `H({engine_version, input_hash, policy_version})`
    ///
    /// # Errors
    ///
    /// Returns error if canonical encoding fails
    pub fn derive(
        engine_version: &Version,
        input_hash: &Digest,
        policy_version: &Digest,
    ) -> Result<Self, CanonicalError> {
        canonical_hash(&json!({
            "engine_version": engine_version,
            "input_hash": input_hash,
            "policy_version": policy_version,
        }))
        .map(Self)
    }

    /// Wrap an existing digest
    #[must_use]
    pub const fn from_digest(digest: Digest) -> Self {
        Self(digest)
    }

    /// Get the underlying digest
    #[must_use]
    pub const fn as_digest(&self) -> &Digest {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::from_hex(s).map(Self)
    }
}

/// Federation node identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id
    ///
    /// # Errors
    ///
    /// Returns error if the id is empty or contains `|`, which separates
    /// fields in handshake signing payloads
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdError::Empty);
        }
        if id.contains('|') || id.chars().any(char::is_whitespace) {
            return Err(IdError::InvalidCharacter(id));
        }
        Ok(Self(id))
    }

    /// Get as string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for NodeId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

/// Identifier errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// Empty identifier
    #[error("identifier must not be empty")]
    Empty,
    /// Identifier contains a reserved character
    #[error("identifier contains a reserved character: {0:?}")]
    InvalidCharacter(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_is_content_derived() {
        let engine = Version::new(1, 0, 0);
        let input = Digest::sha256(b"input");
        let policy = Digest::sha256(b"policy");

        let a = RunId::derive(&engine, &input, &policy).unwrap();
        let b = RunId::derive(&engine, &input, &policy).unwrap();
        assert_eq!(a, b);

        let other = RunId::derive(&Version::new(1, 0, 1), &input, &policy).unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn test_run_id_parse() {
        let id = RunId::derive(
            &Version::new(1, 0, 0),
            &Digest::sha256(b"i"),
            &Digest::sha256(b"p"),
        )
        .unwrap();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_node_id_validation() {
        assert!(NodeId::new("node-a").is_ok());
        assert_eq!(NodeId::new(""), Err(IdError::Empty));
        assert!(matches!(NodeId::new("a|b"), Err(IdError::InvalidCharacter(_))));
        assert!(serde_json::from_str::<NodeId>("\"\"").is_err());
    }
}
