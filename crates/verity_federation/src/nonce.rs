//! Challenge nonce memo.
//!
//! Each peer has its own shard. Entries live for the challenge TTL; a shard
//! holds at most `capacity` outstanding challenges and drops the oldest when
//! full.

use crate::error::HandshakeError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use verity_core::NodeId;

#[derive(Debug, Default)]
struct PeerNonces {
    /// nonce -> issued_at_ms
    issued: HashMap<String, u64>,
    /// nonce -> forget_at_ms
    consumed: HashMap<String, u64>,
}

impl PeerNonces {
    fn evict(&mut self, now_ms: u64, ttl_ms: u64) {
        self.issued
            .retain(|_, issued_at| now_ms.saturating_sub(*issued_at) <= ttl_ms);
        self.consumed.retain(|_, forget_at| *forget_at > now_ms);
    }

    fn check(&self, node: &NodeId, nonce: &str, now_ms: u64, ttl_ms: u64) -> Result<u64, HandshakeError> {
        if self.consumed.get(nonce).is_some_and(|forget_at| *forget_at > now_ms) {
            return Err(HandshakeError::Replayed { node: node.clone() });
        }
        let issued_at = *self
            .issued
            .get(nonce)
            .ok_or_else(|| HandshakeError::UnknownNonce { node: node.clone() })?;
        let age_ms = now_ms.saturating_sub(issued_at);
        if age_ms > ttl_ms {
            return Err(HandshakeError::Expired {
                node: node.clone(),
                age_ms,
                ttl_ms,
            });
        }
        Ok(issued_at)
    }
}

/// Per-peer, time-evicting nonce memo
#[derive(Debug)]
pub struct NonceCache {
    ttl_ms: u64,
    capacity: usize,
    peers: RwLock<HashMap<NodeId, Arc<Mutex<PeerNonces>>>>,
}

impl NonceCache {
    #[must_use]
    pub fn new(ttl_ms: u64, capacity: usize) -> Self {
        Self {
            ttl_ms,
            capacity: capacity.max(1),
            peers: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    fn shard(&self, node: &NodeId) -> Arc<Mutex<PeerNonces>> {
        if let Some(shard) = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node)
        {
            return Arc::clone(shard);
        }
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(peers.entry(node.clone()).or_default())
    }

    /// Remember a freshly issued nonce
    pub fn issue(&self, node: &NodeId, nonce: &str, now_ms: u64) {
        let shard = self.shard(node);
        let mut nonces = shard.lock().unwrap_or_else(PoisonError::into_inner);
        nonces.evict(now_ms, self.ttl_ms);
        while nonces.issued.len() >= self.capacity {
            let oldest = nonces
                .issued
                .iter()
                .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
                .map(|(nonce, _)| nonce.clone());
            match oldest {
                Some(oldest) => {
                    nonces.issued.remove(&oldest);
                }
                None => break,
            }
        }
        nonces.issued.insert(nonce.to_string(), now_ms);
    }

    /// Check that `nonce` is outstanding for `node` without using it up.
    /// Returns the issue time.
    ///
    /// # Errors
    ///
    /// Returns error if the nonce was replayed, never issued, or expired
    pub fn check(&self, node: &NodeId, nonce: &str, now_ms: u64) -> Result<u64, HandshakeError> {
        let shard = self.shard(node);
        let nonces = shard.lock().unwrap_or_else(PoisonError::into_inner);
        nonces.check(node, nonce, now_ms, self.ttl_ms)
    }

    /// Use up `nonce`. Of two concurrent calls for the same nonce exactly
    /// one succeeds.
    ///
    /// # Errors
    ///
    /// Returns error if the nonce was replayed, never issued, or expired
    pub fn consume(&self, node: &NodeId, nonce: &str, now_ms: u64) -> Result<(), HandshakeError> {
        let shard = self.shard(node);
        let mut nonces = shard.lock().unwrap_or_else(PoisonError::into_inner);
        let issued_at = nonces.check(node, nonce, now_ms, self.ttl_ms)?;
        nonces.issued.remove(nonce);
        nonces
            .consumed
            .insert(nonce.to_string(), issued_at.saturating_add(self.ttl_ms).saturating_add(1));
        Ok(())
    }

    /// Outstanding challenges for `node`
    #[must_use]
    pub fn outstanding(&self, node: &NodeId) -> usize {
        let shard = self.shard(node);
        let nonces = shard.lock().unwrap_or_else(PoisonError::into_inner);
        nonces.issued.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    #[test]
    fn test_issue_then_consume_once() {
        let cache = NonceCache::new(1_000, 16);
        let a = node("a");
        cache.issue(&a, "n1", 0);
        assert_eq!(cache.check(&a, "n1", 10).unwrap(), 0);
        cache.consume(&a, "n1", 10).unwrap();
        assert!(matches!(
            cache.consume(&a, "n1", 20),
            Err(HandshakeError::Replayed { .. })
        ));
    }

    #[test]
    fn test_nonce_scoped_to_node() {
        let cache = NonceCache::new(1_000, 16);
        cache.issue(&node("a"), "n1", 0);
        assert!(matches!(
            cache.consume(&node("b"), "n1", 1),
            Err(HandshakeError::UnknownNonce { .. })
        ));
    }

    #[test]
    fn test_expired_nonce_rejected() {
        let cache = NonceCache::new(1_000, 16);
        let a = node("a");
        cache.issue(&a, "n1", 0);
        assert!(matches!(
            cache.consume(&a, "n1", 1_001),
            Err(HandshakeError::Expired { age_ms: 1_001, ttl_ms: 1_000, .. })
        ));
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let cache = NonceCache::new(10_000, 2);
        let a = node("a");
        cache.issue(&a, "n1", 1);
        cache.issue(&a, "n2", 2);
        cache.issue(&a, "n3", 3);
        assert_eq!(cache.outstanding(&a), 2);
        assert!(matches!(
            cache.check(&a, "n1", 4),
            Err(HandshakeError::UnknownNonce { .. })
        ));
        assert!(cache.check(&a, "n3", 4).is_ok());
    }

    #[test]
    fn test_eviction_on_issue() {
        let cache = NonceCache::new(100, 16);
        let a = node("a");
        cache.issue(&a, "old", 0);
        cache.issue(&a, "new", 500);
        assert_eq!(cache.outstanding(&a), 1);
    }

    #[test]
    fn test_concurrent_consume_single_winner() {
        let cache = Arc::new(NonceCache::new(10_000, 16));
        let a = node("a");
        cache.issue(&a, "n", 0);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let a = a.clone();
                std::thread::spawn(move || cache.consume(&a, "n", 1).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }
}
