//! Integrity error types.

use crate::signature::SignatureError;
use verity_core::{CanonicalError, Classify, Digest, ErrorKind, HashError};

/// Integrity layer errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    /// A tree needs at least one content identifier
    #[error("cannot build a Merkle tree from an empty set")]
    EmptyTree,
    /// Leaf index outside the tree
    #[error("leaf index {index} out of range (tree has {len} leaves)")]
    LeafOutOfRange { index: usize, len: usize },
    /// Content identifier not present in the tree
    #[error("content identifier {0} is not a leaf of this tree")]
    UnknownLeaf(Digest),
    /// Named component missing from a pack or bundle
    #[error("unknown component: {0}")]
    UnknownComponent(String),
    /// Recomputed root differs from the recorded one
    #[error("merkle root mismatch: expected {expected}, got {actual}")]
    RootMismatch { expected: Digest, actual: Digest },
    /// Bundle has no signature to check
    #[error("proof bundle is not signed")]
    Unsigned,
    /// Malformed content identifier
    #[error("invalid content identifier: {0}")]
    Cid(#[from] HashError),
    /// Canonical encoding failed
    #[error("canonical encoding failed: {0}")]
    Canonical(#[from] CanonicalError),
    /// Signature error
    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),
}

impl Classify for IntegrityError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyTree | Self::LeafOutOfRange { .. } | Self::Canonical(_) => {
                ErrorKind::Invalid
            }
            Self::UnknownLeaf(_)
            | Self::UnknownComponent(_)
            | Self::RootMismatch { .. }
            | Self::Unsigned
            | Self::Cid(_)
            | Self::Signature(_) => ErrorKind::IntegrityFailure,
        }
    }
}
