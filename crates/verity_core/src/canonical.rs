//! Canonical JSON encoding.
//!
//! Every value that contributes to a digest is written through this module:
//! object keys sorted by byte order, no whitespace, explicit `null`, integers
//! only. Arrays keep their order unless their path has been declared an
//! unordered set, in which case elements are sorted by their own canonical
//! bytes.
//!
//! Paths are dotted object keys, with `[]` standing for "every element of
//! this array", e.g. `events[].payload.tags`.

use crate::hash::{Digest, DigestAlgorithm};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;

/// Canonicalization errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanonicalError {
    /// A floating-point number reached the digest path
    #[error("floating-point value in digest path at `{path}`")]
    FloatInDigestPath {
        /// Path of the offending value
        path: String,
    },
    /// Value could not be converted to JSON
    #[error("value is not serializable: {0}")]
    Serialize(String),
    /// Input text was not valid JSON
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
}

/// Canonical encoder with a set of paths treated as unordered sets
#[derive(Debug, Clone, Default)]
pub struct Canonicalizer {
    unordered: BTreeSet<String>,
    algorithm: DigestAlgorithm,
}

impl Canonicalizer {
    /// Create an encoder with no unordered paths, hashing with SHA-256
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the array at `path` an unordered set
    #[must_use]
    pub fn with_unordered(mut self, path: impl Into<String>) -> Self {
        self.unordered.insert(path.into());
        self
    }

    /// Use a different digest algorithm for [`Canonicalizer::hash`]
    #[must_use]
    pub fn with_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Check whether a path is declared unordered
    #[must_use]
    pub fn is_unordered(&self, path: &str) -> bool {
        self.unordered.contains(path)
    }

    /// Encode any serializable value to canonical bytes
    ///
    /// # Errors
    ///
    /// Returns error if the value contains a float or cannot be serialized
    pub fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CanonicalError> {
        let value =
            serde_json::to_value(value).map_err(|e| CanonicalError::Serialize(e.to_string()))?;
        self.value_bytes(&value)
    }

    /// Encode a JSON value to canonical bytes
    ///
    /// # Errors
    ///
    /// Returns error if the value contains a float
    pub fn value_bytes(&self, value: &Value) -> Result<Vec<u8>, CanonicalError> {
        let mut out = Vec::with_capacity(128);
        let mut path = String::new();
        self.write_value(value, &mut path, &mut out)?;
        Ok(out)
    }

    /// Parse JSON text and re-encode it canonically
    ///
    /// # Errors
    ///
    /// Returns error if the text is not JSON or contains a float
    pub fn canonicalize_str(&self, text: &str) -> Result<Vec<u8>, CanonicalError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| CanonicalError::InvalidJson(e.to_string()))?;
        self.value_bytes(&value)
    }

    /// Convert a value into its canonical JSON form (unordered arrays sorted)
    ///
    /// # Errors
    ///
    /// Returns error if the value contains a float or cannot be serialized
    pub fn to_value<T: Serialize + ?Sized>(&self, value: &T) -> Result<Value, CanonicalError> {
        let bytes = self.to_bytes(value)?;
        serde_json::from_slice(&bytes).map_err(|e| CanonicalError::InvalidJson(e.to_string()))
    }

    /// Digest of the canonical bytes of a value
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be canonicalized
    pub fn hash<T: Serialize + ?Sized>(&self, value: &T) -> Result<Digest, CanonicalError> {
        Ok(self.algorithm.digest(&self.to_bytes(value)?))
    }

    fn write_value(
        &self,
        value: &Value,
        path: &mut String,
        out: &mut Vec<u8>,
    ) -> Result<(), CanonicalError> {
        match value {
            Value::Null => out.extend_from_slice(b"null"),
            Value::Bool(true) => out.extend_from_slice(b"true"),
            Value::Bool(false) => out.extend_from_slice(b"false"),
            Value::Number(n) => {
                if n.is_f64() {
                    return Err(CanonicalError::FloatInDigestPath {
                        path: display_path(path),
                    });
                }
                out.extend_from_slice(n.to_string().as_bytes());
            }
            Value::String(s) => write_string(s, out)?,
            Value::Array(items) => {
                let base = path.len();
                path.push_str("[]");
                let result = if self.unordered.contains(&path[..base]) {
                    self.write_unordered(items, path, out)
                } else {
                    self.write_ordered(items, path, out)
                };
                path.truncate(base);
                result?;
            }
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push(b'{');
                for (i, key) in keys.into_iter().enumerate() {
                    if i > 0 {
                        out.push(b',');
                    }
                    write_string(key, out)?;
                    out.push(b':');
                    let base = path.len();
                    if base > 0 {
                        path.push('.');
                    }
                    path.push_str(key);
                    let result = self.write_value(&map[key], path, out);
                    path.truncate(base);
                    result?;
                }
                out.push(b'}');
            }
        }
        Ok(())
    }

    fn write_ordered(
        &self,
        items: &[Value],
        path: &mut String,
        out: &mut Vec<u8>,
    ) -> Result<(), CanonicalError> {
        out.push(b'[');
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                out.push(b',');
            }
            self.write_value(item, path, out)?;
        }
        out.push(b']');
        Ok(())
    }

    fn write_unordered(
        &self,
        items: &[Value],
        path: &mut String,
        out: &mut Vec<u8>,
    ) -> Result<(), CanonicalError> {
        let mut encoded = Vec::with_capacity(items.len());
        for item in items {
            let mut buf = Vec::new();
            self.write_value(item, path, &mut buf)?;
            encoded.push(buf);
        }
        encoded.sort();
        out.push(b'[');
        for (i, item) in encoded.iter().enumerate() {
            if i > 0 {
                out.push(b',');
            }
            out.extend_from_slice(item);
        }
        out.push(b']');
        Ok(())
    }
}

fn write_string(s: &str, out: &mut Vec<u8>) -> Result<(), CanonicalError> {
    serde_json::to_writer(&mut *out, s).map_err(|e| CanonicalError::Serialize(e.to_string()))
}

fn display_path(path: &str) -> String {
    if path.is_empty() { "$".to_string() } else { path.to_string() }
}

/// Canonical bytes with no unordered paths
///
/// # Errors
///
/// Returns error if the value contains a float or cannot be serialized
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CanonicalError> {
    Canonicalizer::new().to_bytes(value)
}

/// SHA-256 of the canonical bytes of a value
///
/// # Errors
///
/// Returns error if the value contains a float or cannot be serialized
pub fn canonical_hash<T: Serialize + ?Sized>(value: &T) -> Result<Digest, CanonicalError> {
    Canonicalizer::new().hash(value)
}

/// Types with a canonical byte encoding and content digest
pub trait CanonicalEncode: Serialize {
    /// Canonicalizer used for this type; override to declare unordered sets
    fn canonicalizer() -> Canonicalizer {
        Canonicalizer::new()
    }

    /// Encode to canonical bytes
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be canonicalized
    fn canonical_bytes(&self) -> Result<Vec<u8>, CanonicalError> {
        Self::canonicalizer().to_bytes(self)
    }

    /// Content digest over the canonical bytes
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be canonicalized
    fn canonical_hash(&self) -> Result<Digest, CanonicalError> {
        Self::canonicalizer().hash(self)
    }
}
