//! Node identities.
//!
//! Identities are provisioned out of band and only ever read here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use verity_core::{CanonicalError, Digest, NodeId, canonical_hash};
use verity_integrity::PublicKeyBytes;

/// A federation member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    pub org_id: String,
    pub public_key: PublicKeyBytes,
    pub capabilities_hash: Digest,
}

impl NodeIdentity {
    #[must_use]
    pub fn new<S: AsRef<str>>(
        node_id: NodeId,
        org_id: impl Into<String>,
        public_key: PublicKeyBytes,
        capabilities: &[S],
    ) -> Self {
        Self {
            node_id,
            org_id: org_id.into(),
            public_key,
            capabilities_hash: capabilities_hash(capabilities),
        }
    }
}

/// Digest of a capability set: sorted, de-duplicated, comma joined
#[must_use]
pub fn capabilities_hash<S: AsRef<str>>(capabilities: &[S]) -> Digest {
    let mut caps: Vec<&str> = capabilities.iter().map(|c| c.as_ref().trim()).collect();
    caps.sort_unstable();
    caps.dedup();
    Digest::sha256(caps.join(",").as_bytes())
}

/// Known identities, keyed by node id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityRegistry {
    nodes: BTreeMap<NodeId, NodeIdentity>,
}

impl IdentityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, identity: NodeIdentity) -> Self {
        self.insert(identity);
        self
    }

    /// Add or replace an identity
    pub fn insert(&mut self, identity: NodeIdentity) {
        self.nodes.insert(identity.node_id.clone(), identity);
    }

    #[must_use]
    pub fn get(&self, node_id: &NodeId) -> Option<&NodeIdentity> {
        self.nodes.get(node_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Load a JSON array of identities
    ///
    /// # Errors
    ///
    /// Returns error if the document is not an identity list
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let identities: Vec<NodeIdentity> = serde_json::from_str(text)?;
        Ok(identities.into_iter().fold(Self::new(), Self::with))
    }

    /// Digest over every identity in node id order
    ///
    /// # Errors
    ///
    /// Returns error if canonical encoding fails
    pub fn snapshot_hash(&self) -> Result<Digest, CanonicalError> {
        let nodes: Vec<&NodeIdentity> = self.nodes.values().collect();
        canonical_hash(&nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verity_integrity::Signer;

    fn identity(id: &str, caps: &[&str]) -> NodeIdentity {
        NodeIdentity::new(
            NodeId::new(id).unwrap(),
            "org-1",
            Signer::generate().public_key(),
            caps,
        )
    }

    #[test]
    fn test_capabilities_hash_ignores_order_and_duplicates() {
        assert_eq!(
            capabilities_hash(&["b", "a", "a"]),
            capabilities_hash(&["a", "b"])
        );
        assert_ne!(capabilities_hash(&["a"]), capabilities_hash(&["a", "b"]));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = IdentityRegistry::new()
            .with(identity("node-a", &["replay"]))
            .with(identity("node-b", &[]));
        assert_eq!(registry.len(), 2);
        assert!(registry.get(&NodeId::new("node-a").unwrap()).is_some());
        assert!(registry.get(&NodeId::new("node-c").unwrap()).is_none());
    }

    #[test]
    fn test_json_roundtrip_keeps_snapshot_hash() {
        let registry = IdentityRegistry::new()
            .with(identity("node-b", &["x"]))
            .with(identity("node-a", &["y"]));
        let nodes: Vec<&NodeIdentity> = registry.nodes.values().collect();
        let text = serde_json::to_string(&nodes).unwrap();
        let loaded = IdentityRegistry::from_json(&text).unwrap();
        assert_eq!(loaded, registry);
        assert_eq!(loaded.snapshot_hash().unwrap(), registry.snapshot_hash().unwrap());
    }
}
