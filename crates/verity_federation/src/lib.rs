//! VERITY.FABRIC Federation
//!
//! Lets independent trust domains hand work to each other: node identities,
//! the challenge-response handshake, per-peer circuit breakers, retry with
//! backoff, the delegation guard, receiver and delegator, plus quarantine,
//! reputation and the audit trail.

#![warn(clippy::all)]

pub mod audit;
pub mod breaker;
pub mod config;
pub mod delegation;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod nonce;
pub mod quarantine;
pub mod reputation;
pub mod retry;

pub use audit::{AuditEvent, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use breaker::{Admission, BreakerRegistry, BreakerState, Outcome, Permit};
pub use config::{BreakerConfig, FederationConfig, QuarantineConfig, RetryConfig};
pub use delegation::{
    DelegationGuard, DelegationReceiver, DelegationRequest, DelegationResponse, Delegator,
    PeerTransport,
};
pub use error::{CircuitOpen, DelegationError, HandshakeError, TransportError};
pub use handshake::{
    Acceptor, Challenge, ChallengeResponse, HandshakeState, Initiator, NONCE_BYTES, SessionToken,
};
pub use identity::{IdentityRegistry, NodeIdentity, capabilities_hash};
pub use nonce::NonceCache;
pub use quarantine::{QuarantineReason, QuarantineSet};
pub use reputation::{FailureReason, LatencyStats, ReputationBook, ReputationSnapshot, trust_score};
pub use retry::{RetryPolicy, jitter_key};
