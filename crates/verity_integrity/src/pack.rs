//! Integrity anchors for distributable packs.
//!
//! A pack is split into five components, each hashed to a CID, and the CIDs
//! are anchored under one Merkle root. Declared tools and permissions are
//! sets: their order in the manifest does not change the root.

use crate::error::IntegrityError;
use crate::merkle::{MerkleProof, MerkleTree, verify_proof};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use verity_core::{Digest, canonical_bytes};

/// Component names, in the order they are reported
pub const COMPONENTS: [&str; 5] = ["metadata", "tools", "permissions", "graph", "deterministic"];

/// Pack identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackMetadata {
    pub id: String,
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Pack manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackManifest {
    pub metadata: PackMetadata,
    pub spec_version: String,
    #[serde(default)]
    pub declared_tools: Vec<String>,
    #[serde(default)]
    pub declared_permissions: Vec<String>,
    pub deterministic: bool,
}

impl PackManifest {
    /// CID of each component
    ///
    /// # Errors
    ///
    /// Returns error if a component cannot be canonically encoded
    pub fn component_cids(
        &self,
        graph_data: &[u8],
    ) -> Result<BTreeMap<String, Digest>, IntegrityError> {
        // Description is display text and stays outside the anchor
        let identity = (&self.metadata.id, &self.metadata.version, &self.metadata.name);
        let tools: BTreeSet<&str> = self.declared_tools.iter().map(String::as_str).collect();
        let permissions: BTreeSet<&str> =
            self.declared_permissions.iter().map(String::as_str).collect();

        let mut cids = BTreeMap::new();
        cids.insert("metadata".to_string(), Digest::sha256(&canonical_bytes(&identity)?));
        cids.insert("tools".to_string(), Digest::sha256(&canonical_bytes(&tools)?));
        cids.insert(
            "permissions".to_string(),
            Digest::sha256(&canonical_bytes(&permissions)?),
        );
        cids.insert("graph".to_string(), Digest::sha256(graph_data));
        cids.insert(
            "deterministic".to_string(),
            Digest::sha256(&canonical_bytes(&self.deterministic)?),
        );
        Ok(cids)
    }
}

/// Merkle anchor for a pack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackIntegrity {
    pub pack_id: String,
    pub merkle_root: Digest,
    pub components: BTreeMap<String, Digest>,
}

/// Compute the integrity anchor of a pack
///
/// # Errors
///
/// Returns error if a component cannot be encoded
pub fn compute_pack_integrity(
    manifest: &PackManifest,
    graph_data: &[u8],
) -> Result<PackIntegrity, IntegrityError> {
    let components = manifest.component_cids(graph_data)?;
    let tree = MerkleTree::build(components.values().cloned())?;
    tracing::debug!(
        pack_id = %manifest.metadata.id,
        merkle_root = %tree.root(),
        "computed pack integrity"
    );
    Ok(PackIntegrity {
        pack_id: manifest.metadata.id.clone(),
        merkle_root: tree.root().clone(),
        components,
    })
}

impl PackIntegrity {
    /// Rebuild the tree from the recorded component CIDs
    ///
    /// # Errors
    ///
    /// Returns error if there are no components
    pub fn tree(&self) -> Result<MerkleTree, IntegrityError> {
        MerkleTree::build(self.components.values().cloned())
    }

    /// Inclusion proof for a named component
    ///
    /// # Errors
    ///
    /// Returns error if the component is unknown
    pub fn proof(&self, component: &str) -> Result<MerkleProof, IntegrityError> {
        let cid = self
            .components
            .get(component)
            .ok_or_else(|| IntegrityError::UnknownComponent(component.to_string()))?;
        self.tree()?.proof_for(cid)
    }

    /// Whether `cid` is the recorded content of `component` under the root
    #[must_use]
    pub fn verify_component(&self, component: &str, cid: &Digest) -> bool {
        match self.proof(component) {
            Ok(proof) => proof.cid == *cid && verify_proof(&proof, &self.merkle_root),
            Err(_) => false,
        }
    }

    /// Recompute the anchor from a pack and compare
    ///
    /// # Errors
    ///
    /// Returns [`IntegrityError::RootMismatch`] if the pack does not match
    pub fn verify(&self, manifest: &PackManifest, graph_data: &[u8]) -> Result<(), IntegrityError> {
        let recomputed = compute_pack_integrity(manifest, graph_data)?;
        if recomputed.merkle_root != self.merkle_root || recomputed.pack_id != self.pack_id {
            return Err(IntegrityError::RootMismatch {
                expected: self.merkle_root.clone(),
                actual: recomputed.merkle_root,
            });
        }
        Ok(())
    }

    /// Components whose CID differs from a recomputed pack
    ///
    /// # Errors
    ///
    /// Returns error if the pack cannot be encoded
    pub fn changed_components(
        &self,
        manifest: &PackManifest,
        graph_data: &[u8],
    ) -> Result<Vec<String>, IntegrityError> {
        let current = manifest.component_cids(graph_data)?;
        Ok(COMPONENTS
            .iter()
            .filter(|name| self.components.get(**name) != current.get(**name))
            .map(|name| (*name).to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> PackManifest {
        PackManifest {
            metadata: PackMetadata {
                id: "pack.demo".into(),
                version: "1.2.0".into(),
                name: "Demo".into(),
                description: "demo pack".into(),
            },
            spec_version: "1.0".into(),
            declared_tools: vec!["fetch".into(), "write".into()],
            declared_permissions: vec!["net".into(), "fs".into()],
            deterministic: true,
        }
    }

    const GRAPH: &[u8] = br#"{"nodes":[{"id":"a"}],"edges":[]}"#;

    #[test]
    fn test_integrity_verifies() {
        let m = manifest();
        let integrity = compute_pack_integrity(&m, GRAPH).unwrap();
        assert_eq!(integrity.pack_id, "pack.demo");
        assert_eq!(integrity.components.len(), 5);
        assert!(integrity.verify(&m, GRAPH).is_ok());
    }

    #[test]
    fn test_tool_order_does_not_matter() {
        let a = compute_pack_integrity(&manifest(), GRAPH).unwrap();
        let mut m = manifest();
        m.declared_tools.reverse();
        m.declared_permissions.reverse();
        m.metadata.description = "reworded".into();
        let b = compute_pack_integrity(&m, GRAPH).unwrap();
        assert_eq!(a.merkle_root, b.merkle_root);
    }

    #[test]
    fn test_graph_tamper_detected() {
        let m = manifest();
        let integrity = compute_pack_integrity(&m, GRAPH).unwrap();
        let tampered = br#"{"nodes":[{"id":"b"}],"edges":[]}"#;
        assert!(matches!(
            integrity.verify(&m, tampered),
            Err(IntegrityError::RootMismatch { .. })
        ));
        assert_eq!(integrity.changed_components(&m, tampered).unwrap(), vec!["graph"]);
    }

    #[test]
    fn test_deterministic_flag_is_anchored() {
        let integrity = compute_pack_integrity(&manifest(), GRAPH).unwrap();
        let mut m = manifest();
        m.deterministic = false;
        assert!(integrity.verify(&m, GRAPH).is_err());
    }

    #[test]
    fn test_component_proofs() {
        let m = manifest();
        let integrity = compute_pack_integrity(&m, GRAPH).unwrap();
        let graph_cid = Digest::sha256(GRAPH);
        assert!(integrity.verify_component("graph", &graph_cid));
        assert!(!integrity.verify_component("graph", &Digest::sha256(b"other")));
        assert!(!integrity.verify_component("nope", &graph_cid));

        let proof = integrity.proof("tools").unwrap();
        assert!(verify_proof(&proof, &integrity.merkle_root));
    }

    #[test]
    fn test_integrity_serializes_with_hex_root() {
        let integrity = compute_pack_integrity(&manifest(), GRAPH).unwrap();
        let value = serde_json::to_value(&integrity).unwrap();
        assert_eq!(value["merkle_root"].as_str().unwrap().len(), 64);
        let back: PackIntegrity = serde_json::from_value(value).unwrap();
        assert_eq!(back, integrity);
    }
}
