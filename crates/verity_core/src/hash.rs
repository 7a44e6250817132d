//! Digests used as content identifiers.
//!
//! A [`Digest`] is always rendered as lowercase hex. SHA-256 is the default
//! algorithm; SHA-512 produces 128-character identifiers.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

/// A content identifier: the raw bytes of a digest, displayed as lowercase hex
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(Vec<u8>);

impl Digest {
    /// Hex length of a 256-bit digest
    pub const HEX_LEN_256: usize = 64;
    /// Hex length of a 512-bit digest
    pub const HEX_LEN_512: usize = 128;

    /// Compute a SHA-256 digest of data
    #[must_use]
    pub fn sha256(data: &[u8]) -> Self {
        DigestAlgorithm::Sha256.digest(data)
    }

    /// Compute a digest with the given algorithm
    #[must_use]
    pub fn compute(algorithm: DigestAlgorithm, data: &[u8]) -> Self {
        algorithm.digest(data)
    }

    /// Parse a lowercase hex content identifier
    ///
    /// # Errors
    ///
    /// Returns error if the string is not 64 or 128 characters, contains
    /// uppercase characters, or is not valid hex
    pub fn from_hex(s: &str) -> Result<Self, HashError> {
        if s.len() != Self::HEX_LEN_256 && s.len() != Self::HEX_LEN_512 {
            return Err(HashError::InvalidLength(s.len()));
        }
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(HashError::MixedCase(s.to_string()));
        }
        let bytes = hex::decode(s).map_err(|_| HashError::InvalidHex(s.to_string()))?;
        Ok(Self(bytes))
    }

    /// Get the raw digest bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Convert to lowercase hex
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Check whether this digest matches data under the given algorithm
    #[must_use]
    pub fn verify(&self, algorithm: DigestAlgorithm, data: &[u8]) -> bool {
        algorithm.digest(data) == *self
    }

    /// Short prefix for log lines
    #[must_use]
    pub fn short(&self) -> String {
        let hex = self.to_hex();
        hex[..12.min(hex.len())].to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for Digest {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = HashError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_hex()
    }
}

/// Hash algorithm used for content addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// SHA-256 (default, 64 hex characters)
    #[default]
    Sha256,
    /// SHA-512 (128 hex characters)
    Sha512,
    /// BLAKE3 (64 hex characters)
    Blake3,
}

impl DigestAlgorithm {
    /// Digest a single buffer
    #[must_use]
    pub fn digest(&self, data: &[u8]) -> Digest {
        self.digest_parts(&[data])
    }

    /// Digest the concatenation of several buffers without copying them
    #[must_use]
    pub fn digest_parts(&self, parts: &[&[u8]]) -> Digest {
        match self {
            Self::Sha256 => {
                let mut hasher = Sha256::new();
                for part in parts {
                    hasher.update(part);
                }
                Digest(hasher.finalize().to_vec())
            }
            Self::Sha512 => {
                let mut hasher = Sha512::new();
                for part in parts {
                    hasher.update(part);
                }
                Digest(hasher.finalize().to_vec())
            }
            Self::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                for part in parts {
                    hasher.update(part);
                }
                Digest(hasher.finalize().as_bytes().to_vec())
            }
        }
    }

    /// Length of the hex rendering of this algorithm's digests
    #[must_use]
    pub const fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 | Self::Blake3 => Digest::HEX_LEN_256,
            Self::Sha512 => Digest::HEX_LEN_512,
        }
    }

    /// Get algorithm name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
            Self::Blake3 => "blake3",
        }
    }

    /// Parse an algorithm name
    ///
    /// # Errors
    ///
    /// Returns error if the name is unknown
    pub fn parse(s: &str) -> Result<Self, HashError> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            "blake3" => Ok(Self::Blake3),
            other => Err(HashError::UnknownAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Digest format errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashError {
    /// Not valid hex
    #[error("invalid hex digest: {0}")]
    InvalidHex(String),
    /// Wrong number of hex characters
    #[error("invalid digest length: {0} (expected 64 or 128)")]
    InvalidLength(usize),
    /// Uppercase characters are a format error, never normalized
    #[error("digest must be lowercase hex: {0}")]
    MixedCase(String),
    /// Unknown algorithm name
    #[error("unknown digest algorithm: {0}")]
    UnknownAlgorithm(String),
}
