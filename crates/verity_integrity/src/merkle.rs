//! Merkle trees over content identifiers.
//!
//! Leaves are the sorted, de-duplicated CIDs. Leaf and branch hashes are
//! domain separated (`0x00` and `0x01` prefixes) so a leaf can never be
//! passed off as an internal node. An unpaired node at the end of a level
//! is promoted unchanged; nothing is duplicated, so `{a, b, c}` and
//! `{a, b, c, c}` do not share a root.

use crate::error::IntegrityError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use verity_core::{Digest, DigestAlgorithm};

/// Prefix for leaf hashes
pub const LEAF_PREFIX: u8 = 0x00;
/// Prefix for branch hashes
pub const BRANCH_PREFIX: u8 = 0x01;

fn leaf_hash(algorithm: DigestAlgorithm, cid: &Digest) -> Digest {
    algorithm.digest_parts(&[&[LEAF_PREFIX], cid.as_bytes()])
}

fn branch_hash(algorithm: DigestAlgorithm, left: &Digest, right: &Digest) -> Digest {
    algorithm.digest_parts(&[&[BRANCH_PREFIX], left.as_bytes(), right.as_bytes()])
}

/// Which side of the running hash a sibling sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

/// One level of an inclusion proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: Digest,
    pub side: Side,
}

/// Inclusion proof for one CID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    #[serde(default)]
    pub algorithm: DigestAlgorithm,
    pub cid: Digest,
    pub leaf_index: usize,
    pub steps: Vec<ProofStep>,
}

/// Check an inclusion proof against a root.
///
/// Pure predicate: any mismatch, including a malformed proof, is `false`.
#[must_use]
pub fn verify_proof(proof: &MerkleProof, root: &Digest) -> bool {
    let algorithm = proof.algorithm;
    let mut current = leaf_hash(algorithm, &proof.cid);
    for step in &proof.steps {
        current = match step.side {
            Side::Left => branch_hash(algorithm, &step.sibling, &current),
            Side::Right => branch_hash(algorithm, &current, &step.sibling),
        };
    }
    current == *root
}

/// A Merkle tree with every level retained for proof extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    algorithm: DigestAlgorithm,
    cids: Vec<Digest>,
    levels: Vec<Vec<Digest>>,
}

impl MerkleTree {
    /// Build a SHA-256 tree
    ///
    /// # Errors
    ///
    /// Returns [`IntegrityError::EmptyTree`] if no CIDs are given
    pub fn build(cids: impl IntoIterator<Item = Digest>) -> Result<Self, IntegrityError> {
        Self::build_with(DigestAlgorithm::default(), cids)
    }

    /// Build a tree with an explicit algorithm
    ///
    /// # Errors
    ///
    /// Returns [`IntegrityError::EmptyTree`] if no CIDs are given
    pub fn build_with(
        algorithm: DigestAlgorithm,
        cids: impl IntoIterator<Item = Digest>,
    ) -> Result<Self, IntegrityError> {
        // Byte order of the raw digest equals lexicographic order of its
        // lowercase hex rendering.
        let cids: Vec<Digest> = cids.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        if cids.is_empty() {
            return Err(IntegrityError::EmptyTree);
        }

        let mut levels = vec![cids.iter().map(|c| leaf_hash(algorithm, c)).collect::<Vec<_>>()];
        while let Some(level) = levels.last().filter(|l| l.len() > 1) {
            let next = level
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => branch_hash(algorithm, left, right),
                    _ => pair[0].clone(),
                })
                .collect();
            levels.push(next);
        }

        Ok(Self {
            algorithm,
            cids,
            levels,
        })
    }

    /// Build from hex CIDs
    ///
    /// # Errors
    ///
    /// Returns error on a malformed or mixed-case CID, or an empty set
    pub fn from_hex<S: AsRef<str>>(cids: &[S]) -> Result<Self, IntegrityError> {
        let parsed = cids
            .iter()
            .map(|c| Digest::from_hex(c.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::build(parsed)
    }

    #[must_use]
    pub fn root(&self) -> &Digest {
        // levels is never empty and the last level has one node
        &self.levels[self.levels.len() - 1][0]
    }

    #[must_use]
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Leaves in sorted order
    #[must_use]
    pub fn cids(&self) -> &[Digest] {
        &self.cids
    }

    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.cids.len()
    }

    /// Number of levels above the leaves
    #[must_use]
    pub fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    #[must_use]
    pub fn position(&self, cid: &Digest) -> Option<usize> {
        self.cids.binary_search(cid).ok()
    }

    /// Inclusion proof for the leaf at `index`
    ///
    /// # Errors
    ///
    /// Returns error if the index is out of range
    pub fn proof(&self, index: usize) -> Result<MerkleProof, IntegrityError> {
        let cid = self
            .cids
            .get(index)
            .ok_or(IntegrityError::LeafOutOfRange {
                index,
                len: self.cids.len(),
            })?
            .clone();

        let mut steps = Vec::with_capacity(self.depth());
        let mut position = index;
        for level in &self.levels[..self.levels.len() - 1] {
            // A promoted node has no sibling at this level
            if let Some(sibling) = level.get(position ^ 1) {
                let side = if position % 2 == 0 {
                    Side::Right
                } else {
                    Side::Left
                };
                steps.push(ProofStep {
                    sibling: sibling.clone(),
                    side,
                });
            }
            position /= 2;
        }

        Ok(MerkleProof {
            algorithm: self.algorithm,
            cid,
            leaf_index: index,
            steps,
        })
    }

    /// Inclusion proof for a CID
    ///
    /// # Errors
    ///
    /// Returns error if the CID is not a leaf
    pub fn proof_for(&self, cid: &Digest) -> Result<MerkleProof, IntegrityError> {
        let index = self
            .position(cid)
            .ok_or_else(|| IntegrityError::UnknownLeaf(cid.clone()))?;
        self.proof(index)
    }

    #[must_use]
    pub fn summary(&self) -> MerkleSummary {
        MerkleSummary {
            algorithm: self.algorithm,
            root: self.root().clone(),
            leaf_count: self.leaf_count(),
            cids: self.cids.clone(),
        }
    }
}

/// Serializable view of a tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleSummary {
    pub algorithm: DigestAlgorithm,
    pub root: Digest,
    pub leaf_count: usize,
    pub cids: Vec<Digest>,
}
