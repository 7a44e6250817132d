//! Federation errors.

use crate::handshake::HandshakeState;
use verity_core::{Classify, Digest, ErrorKind, NodeId, Version};
use verity_integrity::{IntegrityError, SignatureError};
use verity_log::ManifestError;

/// Handshake failures. All of them reject the peer for this handshake.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    /// Nonce was never issued to this node
    #[error("nonce was not issued to {node}")]
    UnknownNonce { node: NodeId },
    #[error("challenge for {node} expired ({age_ms}ms old, ttl {ttl_ms}ms)")]
    Expired {
        node: NodeId,
        age_ms: u64,
        ttl_ms: u64,
    },
    /// Nonce already answered
    #[error("nonce replayed by {node}")]
    Replayed { node: NodeId },
    #[error("signature from {node} does not verify")]
    BadSignature { node: NodeId },
    #[error("session token is unknown or expired")]
    InvalidSession,
    #[error("invalid handshake transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: HandshakeState,
        to: HandshakeState,
    },
    #[error(transparent)]
    Signature(#[from] SignatureError),
}

impl Classify for HandshakeError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::DelegationRejected
    }
}

/// The breaker for a peer is not admitting attempts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit open for {peer}; retry after {retry_after_ms}ms")]
pub struct CircuitOpen {
    pub peer: NodeId,
    pub retry_after_ms: u64,
}

impl Classify for CircuitOpen {
    fn kind(&self) -> ErrorKind {
        ErrorKind::CircuitOpen
    }
}

/// Failures of the underlying transport
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {0}ms")]
    Timeout(u64),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    /// Peer answered with a refusal
    #[error("peer rejected request: {0}")]
    Rejected(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// Whether another attempt may succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ConnectionRefused(_))
    }
}

impl Classify for TransportError {
    fn kind(&self) -> ErrorKind {
        if self.is_transient() {
            ErrorKind::Transient
        } else {
            ErrorKind::DelegationRejected
        }
    }
}

/// Delegation errors
#[derive(Debug, thiserror::Error)]
pub enum DelegationError {
    /// Local node is the origin or already in the chain
    #[error("recursive delegation: {node} already in chain")]
    RecursiveOrigin { node: NodeId },
    #[error("registry snapshot mismatch: local {local}, request {remote}")]
    RegistryMismatch { local: Digest, remote: Digest },
    #[error("spec_version major mismatch: local {local}, request {remote}")]
    SpecVersionMismatch { local: Version, remote: Version },
    #[error("policy version mismatch: local {local}, request {remote}")]
    PolicyVersionMismatch { local: Digest, remote: Digest },
    #[error("delegation depth {depth} reaches limit {max}")]
    DepthExceeded { depth: u32, max: u32 },
    #[error("pack integrity check failed: {0}")]
    PackIntegrity(#[source] IntegrityError),
    /// Request carries no session token
    #[error("request carries no session")]
    MissingSession,
    #[error("session rejected: {0}")]
    Session(#[source] HandshakeError),
    /// The last hop in the chain is not the node holding the session
    #[error("session belongs to {session}, request claims to come from {claimed}")]
    SenderMismatch { session: NodeId, claimed: NodeId },
    #[error("malformed delegation chain: {reason}")]
    MalformedChain { reason: String },
    #[error("origin signature from {origin} missing or invalid")]
    BadOriginSignature { origin: NodeId },
    #[error("node {node} is quarantined")]
    Quarantined { node: NodeId },
    /// No handshake session is held with the peer
    #[error("no session with {peer}")]
    NoSession { peer: NodeId },
    #[error("no eligible delegation candidate")]
    NoCandidate,
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),
    /// Transport failed and no attempts remain
    #[error("delegation to {peer} failed after {attempts} attempt(s): {source}")]
    Transport {
        peer: NodeId,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    /// Peer returned a result that does not validate
    #[error("invalid result from {peer}: {reason}")]
    InvalidResult { peer: NodeId, reason: String },
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

impl Classify for DelegationError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::RecursiveOrigin { .. }
            | Self::RegistryMismatch { .. }
            | Self::SpecVersionMismatch { .. }
            | Self::PolicyVersionMismatch { .. }
            | Self::DepthExceeded { .. }
            | Self::PackIntegrity(_)
            | Self::MissingSession
            | Self::Session(_)
            | Self::SenderMismatch { .. }
            | Self::MalformedChain { .. }
            | Self::BadOriginSignature { .. }
            | Self::Quarantined { .. }
            | Self::NoSession { .. }
            | Self::NoCandidate => ErrorKind::DelegationRejected,
            Self::CircuitOpen(err) => err.kind(),
            Self::Transport { source, .. } => source.kind(),
            Self::InvalidResult { .. } => ErrorKind::IntegrityFailure,
            Self::Manifest(err) => err.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> NodeId {
        NodeId::new("node-a").unwrap()
    }

    #[test]
    fn test_only_timeouts_and_refusals_are_transient() {
        assert!(TransportError::Timeout(5).is_retryable());
        assert!(TransportError::ConnectionRefused("x".into()).is_retryable());
        assert!(!TransportError::Rejected("policy".into()).is_retryable());
    }

    #[test]
    fn test_guard_rejections_are_not_retried() {
        let err = DelegationError::DepthExceeded { depth: 5, max: 5 };
        assert_eq!(err.kind(), ErrorKind::DelegationRejected);
        assert!(!err.is_retryable());
        let err = DelegationError::RecursiveOrigin { node: node() };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_circuit_open_kind() {
        let err = DelegationError::from(CircuitOpen {
            peer: node(),
            retry_after_ms: 10,
        });
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    }
}
