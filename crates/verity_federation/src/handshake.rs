//! Challenge-response handshake between two nodes.
//!
//! `Challenged -> Signed -> Accepted | Rejected`
//!
//! The acceptor issues a [`Challenge`]; the initiator signs
//! `nonce|policy_version|registry_snapshot_hash|node_id` with its Ed25519
//! key; the acceptor verifies and hands back a short-lived [`SessionToken`].

use crate::audit::{AuditEvent, AuditSink, TracingAuditSink};
use crate::config::FederationConfig;
use crate::error::HandshakeError;
use crate::identity::IdentityRegistry;
use crate::nonce::NonceCache;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;
use verity_core::{Clock, Digest, NodeId, SystemClock};
use verity_integrity::{Signature, Signer, Verifier};

/// Random bytes in a nonce
pub const NONCE_BYTES: usize = 32;

/// Challenge sent by the acceptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub nonce: String,
    pub policy_version: Digest,
    pub registry_snapshot_hash: Digest,
    pub issued_at_ms: u64,
}

impl Challenge {
    /// Bytes the initiator signs
    #[must_use]
    pub fn signing_payload(&self, node_id: &NodeId) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}",
            self.nonce, self.policy_version, self.registry_snapshot_hash, node_id
        )
        .into_bytes()
    }
}

/// Signed answer to a challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub node_id: NodeId,
    pub nonce: String,
    pub signature: Signature,
}

/// Handshake phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    Challenged,
    Signed,
    Accepted,
    Rejected,
}

impl HandshakeState {
    #[must_use]
    pub const fn can_transition_to(&self, next: HandshakeState) -> bool {
        matches!(
            (self, next),
            (Self::Challenged, Self::Signed | Self::Rejected)
                | (Self::Signed, Self::Accepted | Self::Rejected)
        )
    }

    /// Step to `next`
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::InvalidTransition`] for an illegal step
    pub fn advance(&mut self, next: HandshakeState) -> Result<(), HandshakeError> {
        if !self.can_transition_to(next) {
            return Err(HandshakeError::InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

/// Session granted after a successful handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    pub token: Uuid,
    pub node_id: NodeId,
    pub issued_at_ms: u64,
    pub expires_at_ms: u64,
}

impl SessionToken {
    #[must_use]
    pub fn is_valid_at(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Node answering challenges
#[derive(Debug)]
pub struct Initiator {
    node_id: NodeId,
    signer: Signer,
}

impl Initiator {
    #[must_use]
    pub fn new(node_id: NodeId, signer: Signer) -> Self {
        Self { node_id, signer }
    }

    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Sign a challenge
    #[must_use]
    pub fn respond(&self, challenge: &Challenge) -> ChallengeResponse {
        ChallengeResponse {
            node_id: self.node_id.clone(),
            nonce: challenge.nonce.clone(),
            signature: self.signer.sign(&challenge.signing_payload(&self.node_id)),
        }
    }
}

/// Node issuing challenges and sessions
#[derive(Debug)]
pub struct Acceptor {
    policy_version: Digest,
    registry_snapshot_hash: Digest,
    identities: Arc<IdentityRegistry>,
    nonces: NonceCache,
    sessions: RwLock<HashMap<Uuid, SessionToken>>,
    session_ttl_ms: u64,
    session_capacity: usize,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl Acceptor {
    #[must_use]
    pub fn new(
        policy_version: Digest,
        registry_snapshot_hash: Digest,
        identities: Arc<IdentityRegistry>,
        config: &FederationConfig,
    ) -> Self {
        Self {
            policy_version,
            registry_snapshot_hash,
            identities,
            nonces: NonceCache::new(config.challenge_ttl_ms, config.nonce_capacity),
            sessions: RwLock::new(HashMap::new()),
            session_ttl_ms: config.session_ttl_ms,
            session_capacity: config.session_capacity.max(1),
            clock: Arc::new(SystemClock),
            audit: Arc::new(TracingAuditSink),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn identities(&self) -> &Arc<IdentityRegistry> {
        &self.identities
    }

    /// Sessions currently held, live or not yet pruned
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Issue a challenge to a known node
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::UnknownNode`] for unprovisioned nodes
    pub fn challenge(&self, node_id: &NodeId) -> Result<Challenge, HandshakeError> {
        if self.identities.get(node_id).is_none() {
            return Err(HandshakeError::UnknownNode(node_id.clone()));
        }
        let mut bytes = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let nonce = hex::encode(bytes);
        let issued_at_ms = self.clock.now_ms();
        self.nonces.issue(node_id, &nonce, issued_at_ms);
        tracing::debug!(node = %node_id, state = ?HandshakeState::Challenged, "challenge issued");
        Ok(Challenge {
            nonce,
            policy_version: self.policy_version.clone(),
            registry_snapshot_hash: self.registry_snapshot_hash.clone(),
            issued_at_ms,
        })
    }

    /// Verify a response and open a session
    ///
    /// # Errors
    ///
    /// Returns error if the node is unknown, the nonce is unknown, expired
    /// or replayed, or the signature does not verify
    pub fn accept(&self, response: &ChallengeResponse) -> Result<SessionToken, HandshakeError> {
        let node = &response.node_id;
        self.audit
            .record(&AuditEvent::HandshakeStarted { node: node.clone() });
        let mut state = HandshakeState::Challenged;
        let result = self
            .verify(response, &mut state)
            .and_then(|token| state.advance(HandshakeState::Accepted).map(|()| token));
        match result {
            Ok(token) => {
                tracing::info!(node = %node, state = ?state, "handshake accepted");
                self.audit
                    .record(&AuditEvent::HandshakeCompleted { node: node.clone() });
                Ok(token)
            }
            Err(err) => {
                let from = state;
                // Rejected is reachable from every non-terminal state.
                if state.advance(HandshakeState::Rejected).is_err() {
                    tracing::error!(node = %node, from = ?from, "handshake failed in terminal state");
                }
                tracing::warn!(node = %node, from = ?from, error = %err, "handshake rejected");
                self.audit.record(&AuditEvent::HandshakeFailed {
                    node: node.clone(),
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn verify(
        &self,
        response: &ChallengeResponse,
        state: &mut HandshakeState,
    ) -> Result<SessionToken, HandshakeError> {
        let node = &response.node_id;
        let identity = self
            .identities
            .get(node)
            .ok_or_else(|| HandshakeError::UnknownNode(node.clone()))?;

        let now = self.clock.now_ms();
        let issued_at_ms = self.nonces.check(node, &response.nonce, now)?;
        let challenge = Challenge {
            nonce: response.nonce.clone(),
            policy_version: self.policy_version.clone(),
            registry_snapshot_hash: self.registry_snapshot_hash.clone(),
            issued_at_ms,
        };
        let verifier = Verifier::new(&identity.public_key)?;
        if !verifier.verify(&challenge.signing_payload(node), &response.signature)? {
            return Err(HandshakeError::BadSignature { node: node.clone() });
        }
        state.advance(HandshakeState::Signed)?;

        // The nonce is spent only once the signature verifies.
        self.nonces.consume(node, &response.nonce, now)?;

        let token = SessionToken {
            token: Uuid::new_v4(),
            node_id: node.clone(),
            issued_at_ms: now,
            expires_at_ms: now.saturating_add(self.session_ttl_ms),
        };
        self.store_session(token.clone(), now);
        Ok(token)
    }

    fn store_session(&self, token: SessionToken, now_ms: u64) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|_, session| session.is_valid_at(now_ms));
        while sessions.len() >= self.session_capacity {
            let oldest = sessions
                .values()
                .min_by(|a, b| {
                    a.issued_at_ms
                        .cmp(&b.issued_at_ms)
                        .then_with(|| a.token.cmp(&b.token))
                })
                .map(|session| session.token);
            match oldest {
                Some(oldest) => {
                    sessions.remove(&oldest);
                }
                None => break,
            }
        }
        sessions.insert(token.token, token);
    }

    /// Node holding a live session token
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::InvalidSession`] if the token is unknown
    /// or expired
    pub fn validate_session(&self, token: &Uuid) -> Result<NodeId, HandshakeError> {
        let now = self.clock.now_ms();
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|_, session| session.is_valid_at(now));
        sessions
            .get(token)
            .map(|session| session.node_id.clone())
            .ok_or(HandshakeError::InvalidSession)
    }
}
