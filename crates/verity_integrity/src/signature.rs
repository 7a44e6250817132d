//! Ed25519 signatures for node identity and proof bundles.
//!
//! Signatures authenticate who produced something. They never stand in for
//! hash equality, which only proves content integrity.

use ed25519_dalek::Signature as DalekSignature;
use ed25519_dalek::Signer as _;
use ed25519_dalek::Verifier as _;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Signature scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureScheme {
    #[default]
    Ed25519,
}

/// A detached signature, serialized as hex
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub scheme: SignatureScheme,
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
}

impl Signature {
    #[must_use]
    pub fn ed25519(bytes: Vec<u8>) -> Self {
        Self {
            scheme: SignatureScheme::Ed25519,
            bytes,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

/// Holds a signing key
pub struct Signer {
    signing_key: SigningKey,
}

impl Signer {
    /// Create a signer with a fresh random key
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self {
            signing_key: SigningKey::from_bytes(&bytes),
        }
    }

    /// Create a signer from a 32-byte secret
    ///
    /// # Errors
    ///
    /// Returns error if the secret is not 32 bytes
    pub fn from_secret(secret: &[u8]) -> Result<Self, SignatureError> {
        let bytes: [u8; 32] = secret
            .try_into()
            .map_err(|_| SignatureError::InvalidSecretKey)?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKeyBytes {
        PublicKeyBytes(self.signing_key.verifying_key().to_bytes())
    }

    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::ed25519(self.signing_key.sign(message).to_bytes().to_vec())
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Raw Ed25519 public key, serialized as hex
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKeyBytes(pub [u8; 32]);

impl PublicKeyBytes {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex
    ///
    /// # Errors
    ///
    /// Returns error if the hex is invalid or not 32 bytes
    pub fn from_hex(s: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(s).map_err(|_| SignatureError::InvalidHex)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SignatureError::InvalidPublicKey)?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKeyBytes({})", self.to_hex())
    }
}

impl TryFrom<String> for PublicKeyBytes {
    type Error = SignatureError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<PublicKeyBytes> for String {
    fn from(key: PublicKeyBytes) -> Self {
        key.to_hex()
    }
}

/// Verifies signatures against one public key
#[derive(Debug, Clone)]
pub struct Verifier {
    verifying_key: VerifyingKey,
}

impl Verifier {
    /// Create a verifier
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a valid curve point
    pub fn new(public_key: &PublicKeyBytes) -> Result<Self, SignatureError> {
        let verifying_key =
            VerifyingKey::from_bytes(&public_key.0).map_err(|_| SignatureError::InvalidPublicKey)?;
        Ok(Self { verifying_key })
    }

    /// Check a signature over `message`. A well-formed signature that does
    /// not match returns `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns error if the signature bytes are malformed
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<bool, SignatureError> {
        let sig = DalekSignature::from_slice(&signature.bytes)
            .map_err(|_| SignatureError::InvalidSignature)?;
        Ok(self.verifying_key.verify(message, &sig).is_ok())
    }
}

/// Signature errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid hex encoding")]
    InvalidHex,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = Signer::generate();
        let signature = signer.sign(b"payload");
        let verifier = Verifier::new(&signer.public_key()).unwrap();
        assert!(verifier.verify(b"payload", &signature).unwrap());
        assert!(!verifier.verify(b"other", &signature).unwrap());
    }

    #[test]
    fn test_wrong_key_rejects() {
        let a = Signer::from_secret(&[1u8; 32]).unwrap();
        let b = Signer::from_secret(&[2u8; 32]).unwrap();
        let signature = a.sign(b"m");
        let verifier = Verifier::new(&b.public_key()).unwrap();
        assert!(!verifier.verify(b"m", &signature).unwrap());
    }

    #[test]
    fn test_from_secret_is_deterministic() {
        let a = Signer::from_secret(&[9u8; 32]).unwrap();
        let b = Signer::from_secret(&[9u8; 32]).unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.sign(b"x"), b.sign(b"x"));
    }

    #[test]
    fn test_bad_secret_length() {
        assert_eq!(
            Signer::from_secret(&[0u8; 16]).unwrap_err(),
            SignatureError::InvalidSecretKey
        );
    }

    #[test]
    fn test_truncated_signature_is_error() {
        let signer = Signer::generate();
        let verifier = Verifier::new(&signer.public_key()).unwrap();
        let bad = Signature::ed25519(vec![0u8; 10]);
        assert_eq!(
            verifier.verify(b"m", &bad).unwrap_err(),
            SignatureError::InvalidSignature
        );
    }

    #[test]
    fn test_public_key_hex_roundtrip() {
        let key = Signer::generate().public_key();
        assert_eq!(PublicKeyBytes::from_hex(&key.to_hex()).unwrap(), key);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.to_hex()));
        assert!(PublicKeyBytes::from_hex("abcd").is_err());
    }

    #[test]
    fn test_signature_serializes_as_hex() {
        let signature = Signer::from_secret(&[3u8; 32]).unwrap().sign(b"m");
        let value = serde_json::to_value(&signature).unwrap();
        assert_eq!(value["scheme"], "ed25519");
        assert_eq!(value["bytes"].as_str().unwrap().len(), 128);
        let back: Signature = serde_json::from_value(value).unwrap();
        assert_eq!(back, signature);
    }
}
