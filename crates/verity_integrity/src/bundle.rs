//! Proof bundles: portable evidence for one verified execution.
//!
//! The bundle's Merkle root covers the CIDs of its inputs and outputs.
//! [`ProofBundle::verify_integrity`] proves the bundle is internally
//! consistent; [`ProofBundle::verify_signature`] proves who issued it.
//! Neither implies the other.

use crate::error::IntegrityError;
use crate::merkle::{MerkleProof, MerkleTree};
use crate::signature::{PublicKeyBytes, Signature, Signer, Verifier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use verity_core::{CanonicalEncode, Digest};

/// Current bundle format version
pub const PROOF_BUNDLE_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleInputs {
    pub params: Digest,
    pub policy: Digest,
    pub context: Option<Digest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleOutputs {
    pub result: Digest,
    pub transcript: Digest,
    pub trace: Option<Digest>,
}

/// Engine that produced the evidence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub engine_type: String,
    pub version: String,
    pub protocol_version: String,
}

/// Detached issuer signature over the unsigned bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSignature {
    pub key_id: String,
    pub public_key: PublicKeyBytes,
    pub signature: Signature,
}

/// Evidence for a single execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofBundle {
    pub format_version: String,
    pub merkle_root: Digest,
    pub inputs: BundleInputs,
    pub outputs: BundleOutputs,
    pub engine: EngineInfo,
    pub signature: Option<BundleSignature>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CanonicalEncode for ProofBundle {}

fn content_ids(inputs: &BundleInputs, outputs: &BundleOutputs) -> Vec<Digest> {
    [
        Some(&inputs.params),
        Some(&inputs.policy),
        inputs.context.as_ref(),
        Some(&outputs.result),
        Some(&outputs.transcript),
        outputs.trace.as_ref(),
    ]
    .into_iter()
    .flatten()
    .cloned()
    .collect()
}

impl ProofBundle {
    /// Assemble an unsigned bundle and anchor its content
    ///
    /// # Errors
    ///
    /// Returns error if the Merkle tree cannot be built
    pub fn build(
        inputs: BundleInputs,
        outputs: BundleOutputs,
        engine: EngineInfo,
        metadata: BTreeMap<String, String>,
    ) -> Result<Self, IntegrityError> {
        let tree = MerkleTree::build(content_ids(&inputs, &outputs))?;
        Ok(Self {
            format_version: PROOF_BUNDLE_VERSION.to_string(),
            merkle_root: tree.root().clone(),
            inputs,
            outputs,
            engine,
            signature: None,
            metadata,
        })
    }

    /// CIDs anchored under the root
    #[must_use]
    pub fn content_ids(&self) -> Vec<Digest> {
        content_ids(&self.inputs, &self.outputs)
    }

    /// Rebuild the tree from the bundle's CIDs
    ///
    /// # Errors
    ///
    /// Returns error if the tree cannot be built
    pub fn tree(&self) -> Result<MerkleTree, IntegrityError> {
        MerkleTree::build(self.content_ids())
    }

    /// Recompute the root from the bundle's CIDs
    ///
    /// # Errors
    ///
    /// Returns [`IntegrityError::RootMismatch`] if the recorded root differs
    pub fn verify_integrity(&self) -> Result<(), IntegrityError> {
        let tree = self.tree()?;
        if tree.root() != &self.merkle_root {
            return Err(IntegrityError::RootMismatch {
                expected: self.merkle_root.clone(),
                actual: tree.root().clone(),
            });
        }
        Ok(())
    }

    /// Inclusion proof for one of the bundle's CIDs
    ///
    /// # Errors
    ///
    /// Returns error if the CID is not part of the bundle
    pub fn prove(&self, cid: &Digest) -> Result<MerkleProof, IntegrityError> {
        self.tree()?.proof_for(cid)
    }

    fn unsigned(&self) -> Self {
        Self {
            signature: None,
            ..self.clone()
        }
    }

    /// Bytes covered by the signature: the canonical unsigned bundle
    ///
    /// # Errors
    ///
    /// Returns error if the bundle cannot be canonically encoded
    pub fn signing_payload(&self) -> Result<Vec<u8>, IntegrityError> {
        Ok(self.unsigned().canonical_bytes()?)
    }

    /// Content address of the unsigned bundle
    ///
    /// # Errors
    ///
    /// Returns error if the bundle cannot be canonically encoded
    pub fn bundle_id(&self) -> Result<Digest, IntegrityError> {
        Ok(self.unsigned().canonical_hash()?)
    }

    /// Attach an issuer signature
    ///
    /// # Errors
    ///
    /// Returns error if the bundle cannot be canonically encoded
    pub fn sign(mut self, signer: &Signer, key_id: impl Into<String>) -> Result<Self, IntegrityError> {
        let signature = signer.sign(&self.signing_payload()?);
        self.signature = Some(BundleSignature {
            key_id: key_id.into(),
            public_key: signer.public_key(),
            signature,
        });
        Ok(self)
    }

    /// Check the issuer signature against a trusted key. The key embedded in
    /// the bundle is only a hint; a bundle signed by any other key is `false`.
    ///
    /// # Errors
    ///
    /// Returns [`IntegrityError::Unsigned`] if there is no signature, or a
    /// signature error if the key or signature bytes are malformed
    pub fn verify_signature(&self, trusted: &PublicKeyBytes) -> Result<bool, IntegrityError> {
        let attached = self.signature.as_ref().ok_or(IntegrityError::Unsigned)?;
        if attached.public_key != *trusted {
            return Ok(false);
        }
        let verifier = Verifier::new(trusted)?;
        Ok(verifier.verify(&self.signing_payload()?, &attached.signature)?)
    }

    /// Parse a bundle from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the text is not a bundle
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize as pretty JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> ProofBundle {
        ProofBundle::build(
            BundleInputs {
                params: Digest::sha256(b"params"),
                policy: Digest::sha256(b"policy"),
                context: None,
            },
            BundleOutputs {
                result: Digest::sha256(b"result"),
                transcript: Digest::sha256(b"transcript"),
                trace: Some(Digest::sha256(b"trace")),
            },
            EngineInfo {
                engine_type: "reference".into(),
                version: "1.0.0".into(),
                protocol_version: "1".into(),
            },
            BTreeMap::from([("run_id".to_string(), "abc".to_string())]),
        )
        .unwrap()
    }

    #[test]
    fn test_build_is_deterministic() {
        assert_eq!(bundle(), bundle());
        assert_eq!(bundle().bundle_id().unwrap(), bundle().bundle_id().unwrap());
        assert_eq!(bundle().content_ids().len(), 5);
    }

    #[test]
    fn test_integrity_detects_swapped_output() {
        let mut b = bundle();
        assert!(b.verify_integrity().is_ok());
        b.outputs.result = Digest::sha256(b"forged");
        assert!(matches!(
            b.verify_integrity(),
            Err(IntegrityError::RootMismatch { .. })
        ));
    }

    #[test]
    fn test_inclusion_proof_for_transcript() {
        let b = bundle();
        let proof = b.prove(&b.outputs.transcript).unwrap();
        assert!(crate::merkle::verify_proof(&proof, &b.merkle_root));
        assert!(b.prove(&Digest::sha256(b"absent")).is_err());
    }

    #[test]
    fn test_signature_roundtrip() {
        let signer = Signer::from_secret(&[5u8; 32]).unwrap();
        let signed = bundle().sign(&signer, "issuer-1").unwrap();
        assert!(signed.verify_signature(&signer.public_key()).unwrap());
        assert_eq!(signed.bundle_id().unwrap(), bundle().bundle_id().unwrap());

        let text = signed.to_json().unwrap();
        let parsed = ProofBundle::from_json(&text).unwrap();
        assert!(parsed.verify_signature(&signer.public_key()).unwrap());
    }

    #[test]
    fn test_signature_is_not_integrity() {
        let signer = Signer::from_secret(&[5u8; 32]).unwrap();
        let mut signed = bundle().sign(&signer, "issuer-1").unwrap();
        signed.metadata.insert("note".into(), "edited".into());
        assert!(signed.verify_integrity().is_ok());
        assert!(!signed.verify_signature(&signer.public_key()).unwrap());
    }

    #[test]
    fn test_untrusted_key_and_unsigned() {
        let signer = Signer::from_secret(&[5u8; 32]).unwrap();
        let other = Signer::from_secret(&[6u8; 32]).unwrap();
        let signed = bundle().sign(&signer, "issuer-1").unwrap();
        assert!(!signed.verify_signature(&other.public_key()).unwrap());
        assert_eq!(
            bundle().verify_signature(&signer.public_key()).unwrap_err(),
            IntegrityError::Unsigned
        );
    }

    #[test]
    fn test_optional_fields_serialize_as_null() {
        let value = serde_json::to_value(bundle()).unwrap();
        assert!(value["inputs"]["context"].is_null());
        assert!(value["signature"].is_null());
    }
}
