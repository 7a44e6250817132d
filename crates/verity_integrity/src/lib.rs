//! Integrity and proof layer for VERITY.FABRIC.
//!
//! Merkle trees over content identifiers, inclusion proofs, pack integrity
//! anchors, proof bundles, and the Ed25519 signatures that authenticate
//! them.

pub mod bundle;
pub mod error;
pub mod merkle;
pub mod pack;
pub mod signature;

pub use bundle::{BundleInputs, BundleOutputs, BundleSignature, EngineInfo, ProofBundle};
pub use error::IntegrityError;
pub use merkle::{MerkleProof, MerkleSummary, MerkleTree, ProofStep, Side, verify_proof};
pub use pack::{PackIntegrity, PackManifest, PackMetadata, compute_pack_integrity};
pub use signature::{PublicKeyBytes, Signature, SignatureError, SignatureScheme, Signer, Verifier};
