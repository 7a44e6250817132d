//! Delegating work to peer nodes.
//!
//! A receiving node runs every request through a [`DelegationReceiver`]
//! before executing anything. The receiver binds the request to a live
//! handshake session, checks the origin's signature and the shape of the
//! chain, refuses quarantined nodes, and then applies the
//! [`DelegationGuard`]. The sending side goes through a [`Delegator`], which
//! wraps each attempt in the peer's circuit breaker and a latency bound,
//! retries transient transport failures with backoff, and re-validates the
//! manifest that comes back.

use crate::audit::{AuditEvent, AuditSink, TracingAuditSink};
use crate::breaker::BreakerRegistry;
use crate::config::FederationConfig;
use crate::error::{DelegationError, TransportError};
use crate::handshake::{Acceptor, SessionToken};
use crate::quarantine::{QuarantineReason, QuarantineSet};
use crate::reputation::{FailureReason, ReputationBook};
use crate::retry::{RetryPolicy, jitter_key};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use uuid::Uuid;
use verity_core::{CanonicalError, Digest, NodeId, Version, canonical_bytes};
use verity_integrity::{
    PackIntegrity, PackManifest, Signature, Signer, Verifier, compute_pack_integrity,
};
use verity_log::{Event, RunManifest, log::event_log_hash};

/// Work forwarded from one node to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationRequest {
    pub request_id: Uuid,
    pub origin_node_id: NodeId,
    /// Every node that has handled the request, origin first
    pub chain: Vec<NodeId>,
    /// Hops taken by the time the request arrives
    pub depth: u32,
    pub registry_snapshot_hash: Digest,
    pub spec_version: Version,
    pub policy_version: Digest,
    pub pack: PackManifest,
    #[serde(with = "hex_bytes")]
    pub graph_data: Vec<u8>,
    pub pack_integrity: PackIntegrity,
    #[serde(default)]
    pub inputs: Value,
    /// Origin's signature over [`DelegationRequest::origin_payload`]
    #[serde(default)]
    pub origin_signature: Option<Signature>,
    /// Session the sending hop holds with the receiver
    #[serde(default)]
    pub session: Option<Uuid>,
}

/// What the origin signs
#[derive(Serialize)]
struct OriginClaims<'a> {
    request_id: &'a Uuid,
    origin_node_id: &'a NodeId,
    registry_snapshot_hash: &'a Digest,
    spec_version: &'a Version,
    policy_version: &'a Digest,
    pack_integrity: &'a PackIntegrity,
    inputs: &'a Value,
}

impl DelegationRequest {
    /// Whether `node` has already seen this request
    #[must_use]
    pub fn involves(&self, node: &NodeId) -> bool {
        self.origin_node_id == *node || self.chain.contains(node)
    }

    /// Canonical bytes of the fields the origin vouches for. Hops may
    /// extend the chain and swap the session; nothing else.
    ///
    /// # Errors
    ///
    /// Returns error if the inputs are not canonical
    pub fn origin_payload(&self) -> Result<Vec<u8>, CanonicalError> {
        canonical_bytes(&OriginClaims {
            request_id: &self.request_id,
            origin_node_id: &self.origin_node_id,
            registry_snapshot_hash: &self.registry_snapshot_hash,
            spec_version: &self.spec_version,
            policy_version: &self.policy_version,
            pack_integrity: &self.pack_integrity,
            inputs: &self.inputs,
        })
    }
}

/// A peer's answer: the run it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationResponse {
    pub request_id: Uuid,
    pub node_id: NodeId,
    pub manifest: RunManifest,
    pub events: Vec<Event>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

/// Admission checks run by the receiving node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationGuard {
    pub local_node: NodeId,
    pub registry_snapshot_hash: Digest,
    pub spec_version: Version,
    pub policy_version: Digest,
    pub max_depth: u32,
}

impl DelegationGuard {
    /// Reject the request or let it through. Checks run in a fixed order and
    /// the first failure is returned.
    ///
    /// # Errors
    ///
    /// Returns the first failing check
    pub fn check(&self, request: &DelegationRequest) -> Result<(), DelegationError> {
        match self.first_failure(request) {
            Ok(()) => {
                tracing::debug!(
                    request_id = %request.request_id,
                    origin = %request.origin_node_id,
                    depth = request.depth,
                    "delegation request admitted"
                );
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    request_id = %request.request_id,
                    origin = %request.origin_node_id,
                    depth = request.depth,
                    error = %err,
                    "delegation request rejected"
                );
                Err(err)
            }
        }
    }

    fn first_failure(&self, request: &DelegationRequest) -> Result<(), DelegationError> {
        if request.involves(&self.local_node) {
            return Err(DelegationError::RecursiveOrigin {
                node: self.local_node.clone(),
            });
        }
        if request.registry_snapshot_hash != self.registry_snapshot_hash {
            return Err(DelegationError::RegistryMismatch {
                local: self.registry_snapshot_hash.clone(),
                remote: request.registry_snapshot_hash.clone(),
            });
        }
        if request.spec_version.major != self.spec_version.major {
            return Err(DelegationError::SpecVersionMismatch {
                local: self.spec_version,
                remote: request.spec_version,
            });
        }
        if request.policy_version != self.policy_version {
            return Err(DelegationError::PolicyVersionMismatch {
                local: self.policy_version.clone(),
                remote: request.policy_version.clone(),
            });
        }
        if request.depth >= self.max_depth {
            return Err(DelegationError::DepthExceeded {
                depth: request.depth,
                max: self.max_depth,
            });
        }
        request
            .pack_integrity
            .verify(&request.pack, &request.graph_data)
            .map_err(DelegationError::PackIntegrity)
    }
}

/// Receiving side of delegation
#[derive(Debug)]
pub struct DelegationReceiver {
    guard: DelegationGuard,
    acceptor: Arc<Acceptor>,
    quarantine: Arc<QuarantineSet>,
    audit: Arc<dyn AuditSink>,
}

impl DelegationReceiver {
    #[must_use]
    pub fn new(guard: DelegationGuard, acceptor: Arc<Acceptor>) -> Self {
        Self {
            guard,
            acceptor,
            quarantine: Arc::new(QuarantineSet::default()),
            audit: Arc::new(TracingAuditSink),
        }
    }

    /// Share a quarantine set with the local [`Delegator`]
    #[must_use]
    pub fn with_quarantine(mut self, quarantine: Arc<QuarantineSet>) -> Self {
        self.quarantine = quarantine;
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn guard(&self) -> &DelegationGuard {
        &self.guard
    }

    /// Admit a request. Returns the authenticated node that sent it.
    ///
    /// # Errors
    ///
    /// Returns error if the sender is not authenticated, the origin
    /// signature or chain does not hold, a node involved is quarantined, or
    /// the guard rejects the request
    pub fn receive(&self, request: &DelegationRequest) -> Result<NodeId, DelegationError> {
        self.audit.record(&AuditEvent::DelegationReceived {
            request_id: request.request_id,
            origin: request.origin_node_id.clone(),
        });
        match self.admit(request) {
            Ok(sender) => {
                self.audit.record(&AuditEvent::DelegationAccepted {
                    request_id: request.request_id,
                    origin: request.origin_node_id.clone(),
                });
                Ok(sender)
            }
            Err(err) => {
                self.audit.record(&AuditEvent::DelegationRejected {
                    request_id: request.request_id,
                    origin: request.origin_node_id.clone(),
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn admit(&self, request: &DelegationRequest) -> Result<NodeId, DelegationError> {
        let sender = self.authenticate(request)?;
        for node in [&request.origin_node_id, &sender] {
            if self.quarantine.is_quarantined(node) {
                tracing::warn!(node = %node, request_id = %request.request_id, "request from quarantined node");
                return Err(DelegationError::Quarantined { node: node.clone() });
            }
        }
        if let Err(err) = self.guard.check(request) {
            // Only reached once the origin is authenticated, so nobody can
            // get a third party quarantined.
            let origin = &request.origin_node_id;
            match &err {
                DelegationError::SpecVersionMismatch { .. } => {
                    self.quarantine
                        .quarantine(origin, QuarantineReason::SpecIncompatible);
                }
                DelegationError::PackIntegrity(_) => {
                    self.quarantine.record_failure(origin);
                }
                _ => {}
            }
            return Err(err);
        }
        Ok(sender)
    }

    fn authenticate(&self, request: &DelegationRequest) -> Result<NodeId, DelegationError> {
        let reject = |err: DelegationError| {
            tracing::warn!(request_id = %request.request_id, error = %err, "unauthenticated delegation request");
            err
        };
        let session = request
            .session
            .ok_or_else(|| reject(DelegationError::MissingSession))?;
        let sender = self
            .acceptor
            .validate_session(&session)
            .map_err(|err| reject(DelegationError::Session(err)))?;

        if request.chain.first() != Some(&request.origin_node_id) {
            return Err(reject(DelegationError::MalformedChain {
                reason: "chain does not start at the origin".to_string(),
            }));
        }
        if usize::try_from(request.depth).ok() != Some(request.chain.len()) {
            return Err(reject(DelegationError::MalformedChain {
                reason: format!(
                    "depth {} but chain has {} nodes",
                    request.depth,
                    request.chain.len()
                ),
            }));
        }
        if request.chain.last() != Some(&sender) {
            return Err(reject(DelegationError::SenderMismatch {
                session: sender,
                claimed: request
                    .chain
                    .last()
                    .cloned()
                    .unwrap_or_else(|| request.origin_node_id.clone()),
            }));
        }

        let origin = &request.origin_node_id;
        let bad_origin = || DelegationError::BadOriginSignature {
            origin: origin.clone(),
        };
        let signature = request
            .origin_signature
            .as_ref()
            .ok_or_else(|| reject(bad_origin()))?;
        let identity = self
            .acceptor
            .identities()
            .get(origin)
            .ok_or_else(|| reject(bad_origin()))?;
        let payload = request
            .origin_payload()
            .map_err(|_| reject(bad_origin()))?;
        let verified = Verifier::new(&identity.public_key)
            .and_then(|verifier| verifier.verify(&payload, signature))
            .unwrap_or(false);
        if !verified {
            return Err(reject(bad_origin()));
        }
        Ok(sender)
    }
}

/// Carries a request to a peer
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn delegate(
        &self,
        peer: &NodeId,
        request: &DelegationRequest,
    ) -> Result<DelegationResponse, TransportError>;
}

/// Sends delegation requests
pub struct Delegator {
    guard: DelegationGuard,
    signer: Arc<Signer>,
    config: FederationConfig,
    transport: Arc<dyn PeerTransport>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryPolicy,
    sessions: RwLock<HashMap<NodeId, Uuid>>,
    quarantine: Arc<QuarantineSet>,
    reputation: Arc<ReputationBook>,
}

impl std::fmt::Debug for Delegator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delegator")
            .field("local_node", &self.guard.local_node)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Delegator {
    /// `signer` must hold the key registered for the local node
    #[must_use]
    pub fn new(
        guard: DelegationGuard,
        signer: Arc<Signer>,
        config: FederationConfig,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            breakers: Arc::new(BreakerRegistry::new(config.breaker)),
            retry: RetryPolicy::new(config.retry),
            quarantine: Arc::new(QuarantineSet::new(config.quarantine)),
            reputation: Arc::new(ReputationBook::new()),
            sessions: RwLock::new(HashMap::new()),
            guard,
            signer,
            config,
            transport,
        }
    }

    /// Share a breaker registry with other delegators
    #[must_use]
    pub fn with_breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    /// Share a quarantine set with other delegators or the local receiver
    #[must_use]
    pub fn with_quarantine(mut self, quarantine: Arc<QuarantineSet>) -> Self {
        self.quarantine = quarantine;
        self
    }

    #[must_use]
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    #[must_use]
    pub fn quarantine(&self) -> &Arc<QuarantineSet> {
        &self.quarantine
    }

    #[must_use]
    pub fn reputation(&self) -> &Arc<ReputationBook> {
        &self.reputation
    }

    #[must_use]
    pub fn guard(&self) -> &DelegationGuard {
        &self.guard
    }

    /// Remember the session `peer` granted this node in a handshake
    pub fn register_session(&self, peer: NodeId, session: &SessionToken) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, session.token);
    }

    fn session_for(&self, peer: &NodeId) -> Option<Uuid> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .copied()
    }

    /// A new request originating at this node, signed by it
    ///
    /// # Errors
    ///
    /// Returns error if the pack cannot be anchored or the inputs are not
    /// canonical
    pub fn originate(
        &self,
        pack: PackManifest,
        graph_data: Vec<u8>,
        inputs: Value,
    ) -> Result<DelegationRequest, DelegationError> {
        let pack_integrity =
            compute_pack_integrity(&pack, &graph_data).map_err(DelegationError::PackIntegrity)?;
        let mut request = DelegationRequest {
            request_id: Uuid::new_v4(),
            origin_node_id: self.guard.local_node.clone(),
            chain: vec![self.guard.local_node.clone()],
            depth: 1,
            registry_snapshot_hash: self.guard.registry_snapshot_hash.clone(),
            spec_version: self.guard.spec_version,
            policy_version: self.guard.policy_version.clone(),
            pack,
            graph_data,
            pack_integrity,
            inputs,
            origin_signature: None,
            session: None,
        };
        let payload = request
            .origin_payload()
            .map_err(verity_log::ManifestError::from)?;
        request.origin_signature = Some(self.signer.sign(&payload));
        Ok(request)
    }

    /// Admit a received request and extend it by one hop
    ///
    /// # Errors
    ///
    /// Returns error if the guard rejects the request
    pub fn forward(&self, request: &DelegationRequest) -> Result<DelegationRequest, DelegationError> {
        self.guard.check(request)?;
        let mut next = request.clone();
        next.chain.push(self.guard.local_node.clone());
        next.depth = next.depth.saturating_add(1);
        next.session = None;
        Ok(next)
    }

    /// Best peer for `request`: not in its chain, not quarantined, holding
    /// a session and admitted by its breaker. Ranked by trust score, then
    /// node id.
    #[must_use]
    pub fn select_peer(&self, peers: &[NodeId], request: &DelegationRequest) -> Option<NodeId> {
        let eligible = peers.iter().filter(|peer| {
            !request.involves(peer)
                && !self.quarantine.is_quarantined(peer)
                && self.session_for(peer).is_some()
                && self.breakers.would_admit(peer)
        });
        self.reputation
            .rank(eligible)
            .into_iter()
            .next()
            .map(|(peer, _)| peer)
    }

    /// Send `request` to the best of `peers`
    ///
    /// # Errors
    ///
    /// Returns [`DelegationError::NoCandidate`] if no peer is eligible, or
    /// any error of [`Delegator::delegate`]
    pub async fn delegate_to_best(
        &self,
        peers: &[NodeId],
        request: &DelegationRequest,
    ) -> Result<DelegationResponse, DelegationError> {
        let peer = self
            .select_peer(peers, request)
            .ok_or(DelegationError::NoCandidate)?;
        self.delegate(&peer, request).await
    }

    /// Send `request` to `peer`
    ///
    /// # Errors
    ///
    /// Returns error if the peer is already in the chain, quarantined or
    /// without a session, its breaker is open, the transport fails after all
    /// attempts, or the result does not validate
    pub async fn delegate(
        &self,
        peer: &NodeId,
        request: &DelegationRequest,
    ) -> Result<DelegationResponse, DelegationError> {
        if request.involves(peer) {
            return Err(DelegationError::RecursiveOrigin { node: peer.clone() });
        }
        if self.quarantine.is_quarantined(peer) {
            return Err(DelegationError::Quarantined { node: peer.clone() });
        }
        let session = self
            .session_for(peer)
            .ok_or_else(|| DelegationError::NoSession { peer: peer.clone() })?;
        let mut outgoing = request.clone();
        outgoing.session = Some(session);

        let max_attempts = self.retry.max_attempts().max(1);
        let latency_ms = self.config.max_delegation_latency_ms;
        let key = jitter_key(&request.request_id, peer);
        let mut attempts = 0u32;

        loop {
            let permit = self.breakers.acquire(peer)?;
            attempts += 1;
            let started = tokio::time::Instant::now();
            let outcome = match tokio::time::timeout(
                Duration::from_millis(latency_ms),
                self.transport.delegate(peer, &outgoing),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(latency_ms)),
            };

            match outcome {
                Ok(response) => {
                    return match validate_response(peer, request, &response) {
                        Ok(()) => {
                            permit.success();
                            let elapsed_ms =
                                u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                            let score = self.reputation.record_success(peer, elapsed_ms);
                            tracing::info!(
                                peer = %peer,
                                request_id = %request.request_id,
                                attempts,
                                trust = score,
                                fingerprint = %response.manifest.fingerprint.short(),
                                "delegation completed"
                            );
                            Ok(response)
                        }
                        Err(err) => {
                            permit.failure();
                            tracing::warn!(peer = %peer, error = %err, "delegated result rejected");
                            let reason = match err {
                                DelegationError::PolicyVersionMismatch { .. } => {
                                    FailureReason::PolicyDenied
                                }
                                _ => FailureReason::ReplayMismatch,
                            };
                            self.penalize(peer, reason);
                            Err(err)
                        }
                    };
                }
                Err(err) => {
                    permit.failure();
                    if !err.is_transient() || attempts >= max_attempts {
                        tracing::warn!(peer = %peer, attempts, error = %err, "delegation failed");
                        self.penalize(peer, FailureReason::Transport);
                        return Err(DelegationError::Transport {
                            peer: peer.clone(),
                            attempts,
                            source: err,
                        });
                    }
                    let delay = self.retry.delay(attempts - 1, key);
                    tracing::debug!(
                        peer = %peer,
                        attempt = attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "retrying delegation"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn penalize(&self, peer: &NodeId, reason: FailureReason) {
        let score = self.reputation.record_failure(peer, reason);
        if reason == FailureReason::ReplayMismatch {
            self.quarantine
                .quarantine(peer, QuarantineReason::ReplayMismatch);
        } else if score < self.config.quarantine.trust_threshold {
            self.quarantine
                .quarantine(peer, QuarantineReason::LowTrust { score });
        }
    }
}

/// Check a peer's answer against the request it was given
fn validate_response(
    peer: &NodeId,
    request: &DelegationRequest,
    response: &DelegationResponse,
) -> Result<(), DelegationError> {
    let invalid = |reason: String| DelegationError::InvalidResult {
        peer: peer.clone(),
        reason,
    };
    if response.request_id != request.request_id {
        return Err(invalid(format!(
            "answers request {} instead of {}",
            response.request_id, request.request_id
        )));
    }
    let manifest = &response.manifest;
    if manifest.policy_version != request.policy_version {
        return Err(DelegationError::PolicyVersionMismatch {
            local: request.policy_version.clone(),
            remote: manifest.policy_version.clone(),
        });
    }
    manifest.verify_fingerprint()?;
    if manifest.event_count != response.events.len() as u64 {
        return Err(invalid(format!(
            "manifest records {} events, response carries {}",
            manifest.event_count,
            response.events.len()
        )));
    }
    let recomputed = event_log_hash(&response.events).map_err(verity_log::ManifestError::from)?;
    if recomputed != manifest.event_log_hash {
        return Err(invalid(format!(
            "event_log_hash {} does not match events ({recomputed})",
            manifest.event_log_hash.short()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::breaker::BreakerState;
    use crate::config::{QuarantineConfig, RetryConfig};
    use crate::error::HandshakeError;
    use crate::handshake::Initiator;
    use crate::identity::{IdentityRegistry, NodeIdentity};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use verity_core::{Classify, ErrorKind, ManualClock};
    use verity_integrity::PackMetadata;
    use verity_log::{ExecutionContext, RunRecorder};

    const GRAPH: &[u8] = br#"{"nodes":[{"id":"a"}],"edges":[]}"#;
    const NODES: &[&str] = &["origin", "middle", "peer", "last", "mallory"];

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    /// Deterministic key per node id
    fn signer(id: &str) -> Signer {
        Signer::from_secret(Digest::sha256(id.as_bytes()).as_bytes()).unwrap()
    }

    fn policy() -> Digest {
        Digest::sha256(b"policy")
    }

    fn registry() -> Digest {
        Digest::sha256(b"registry")
    }

    fn pack() -> PackManifest {
        PackManifest {
            metadata: PackMetadata {
                id: "pack.demo".into(),
                version: "1.0.0".into(),
                name: "Demo".into(),
                description: String::new(),
            },
            spec_version: "1.0".into(),
            declared_tools: vec!["fetch".into()],
            declared_permissions: vec![],
            deterministic: true,
        }
    }

    fn guard(local: &str) -> DelegationGuard {
        DelegationGuard {
            local_node: node(local),
            registry_snapshot_hash: registry(),
            spec_version: Version::new(1, 0, 0),
            policy_version: policy(),
            max_depth: 5,
        }
    }

    fn config() -> FederationConfig {
        FederationConfig {
            retry: RetryConfig {
                max_jitter_ms: 0,
                ..RetryConfig::default()
            },
            ..FederationConfig::default()
        }
    }

    fn token(holder: &str) -> SessionToken {
        SessionToken {
            token: Uuid::new_v4(),
            node_id: node(holder),
            issued_at_ms: 0,
            expires_at_ms: u64::MAX,
        }
    }

    /// Delegator at `local` holding sessions with `peers`
    fn delegator(local: &str, transport: Arc<dyn PeerTransport>, peers: &[&str]) -> Delegator {
        let delegator = Delegator::new(guard(local), Arc::new(signer(local)), config(), transport);
        for peer in peers {
            delegator.register_session(node(peer), &token(local));
        }
        delegator
    }

    fn request() -> DelegationRequest {
        delegator("origin", Arc::new(Scripted::new(vec![])), &[])
            .originate(pack(), GRAPH.to_vec(), json!({"q": 1}))
            .unwrap()
    }

    fn resign(request: &mut DelegationRequest, by: &str) {
        request.origin_signature = Some(signer(by).sign(&request.origin_payload().unwrap()));
    }

    fn response_for(request: &DelegationRequest) -> DelegationResponse {
        let ctx = ExecutionContext::new(Version::new(1, 0, 0), request.policy_version.clone())
            .with_inputs(&request.inputs)
            .unwrap();
        let mut recorder = RunRecorder::start(ctx).unwrap();
        recorder.state("answer", json!(42)).unwrap();
        let run = recorder.complete(json!({"ok": true})).unwrap();
        DelegationResponse {
            request_id: request.request_id,
            node_id: node("peer"),
            manifest: run.manifest,
            events: run.events,
        }
    }

    /// Receiving node `local` with every test node provisioned
    struct Receiving {
        acceptor: Arc<Acceptor>,
        receiver: DelegationReceiver,
        quarantine: Arc<QuarantineSet>,
        audit: Arc<MemoryAuditSink>,
    }

    impl Receiving {
        fn new(local: &str) -> Self {
            let mut identities = IdentityRegistry::new();
            for id in NODES {
                identities.insert(NodeIdentity::new(node(id), "org", signer(id).public_key(), &["replay"]));
            }
            let acceptor = Arc::new(
                Acceptor::new(policy(), registry(), Arc::new(identities), &config())
                    .with_clock(Arc::new(ManualClock::new(1_000))),
            );
            let quarantine = Arc::new(QuarantineSet::default());
            let audit = Arc::new(MemoryAuditSink::new());
            let receiver = DelegationReceiver::new(guard(local), Arc::clone(&acceptor))
                .with_quarantine(Arc::clone(&quarantine))
                .with_audit(audit.clone());
            Self {
                acceptor,
                receiver,
                quarantine,
                audit,
            }
        }

        /// Run a real handshake for `id` and return its session
        fn session(&self, id: &str) -> Uuid {
            let initiator = Initiator::new(node(id), signer(id));
            let challenge = self.acceptor.challenge(initiator.node_id()).unwrap();
            self.acceptor.accept(&initiator.respond(&challenge)).unwrap().token
        }
    }

    /// Replays a fixed script of outcomes, then answers successfully
    struct Scripted {
        script: Mutex<VecDeque<TransportError>>,
        calls: AtomicU32,
        sessions: Mutex<Vec<Option<Uuid>>>,
    }

    impl Scripted {
        fn new(script: Vec<TransportError>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
                sessions: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PeerTransport for Scripted {
        async fn delegate(
            &self,
            _peer: &NodeId,
            request: &DelegationRequest,
        ) -> Result<DelegationResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sessions.lock().unwrap().push(request.session);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(err) => Err(err),
                None => Ok(response_for(request)),
            }
        }
    }

    /// Never answers
    struct Hanging;

    #[async_trait]
    impl PeerTransport for Hanging {
        async fn delegate(
            &self,
            _peer: &NodeId,
            _request: &DelegationRequest,
        ) -> Result<DelegationResponse, TransportError> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Err(TransportError::Rejected("unreachable".into()))
        }
    }

    /// Answers with a tampered manifest
    struct Tampering;

    #[async_trait]
    impl PeerTransport for Tampering {
        async fn delegate(
            &self,
            _peer: &NodeId,
            request: &DelegationRequest,
        ) -> Result<DelegationResponse, TransportError> {
            let mut response = response_for(request);
            response.events.pop();
            Ok(response)
        }
    }

    /// Hands requests straight to a receiver
    struct Loopback {
        receiving: Receiving,
    }

    #[async_trait]
    impl PeerTransport for Loopback {
        async fn delegate(
            &self,
            _peer: &NodeId,
            request: &DelegationRequest,
        ) -> Result<DelegationResponse, TransportError> {
            self.receiving
                .receiver
                .receive(request)
                .map_err(|err| TransportError::Rejected(err.to_string()))?;
            Ok(response_for(request))
        }
    }

    #[test]
    fn test_guard_accepts_fresh_request() {
        assert!(guard("peer").check(&request()).is_ok());
    }

    #[test]
    fn test_guard_rejects_recursive_origin() {
        let req = request();
        assert!(matches!(
            guard("origin").check(&req),
            Err(DelegationError::RecursiveOrigin { .. })
        ));
        let mut forwarded = req;
        forwarded.chain.push(node("middle"));
        assert!(matches!(
            guard("middle").check(&forwarded),
            Err(DelegationError::RecursiveOrigin { .. })
        ));
    }

    #[test]
    fn test_guard_rejections_in_order() {
        let mut req = request();
        req.registry_snapshot_hash = Digest::sha256(b"other");
        req.policy_version = Digest::sha256(b"other");
        assert!(matches!(
            guard("peer").check(&req),
            Err(DelegationError::RegistryMismatch { .. })
        ));

        let mut req = request();
        req.spec_version = Version::new(2, 0, 0);
        assert!(matches!(
            guard("peer").check(&req),
            Err(DelegationError::SpecVersionMismatch { .. })
        ));

        let mut req = request();
        req.spec_version = Version::new(1, 9, 3);
        assert!(guard("peer").check(&req).is_ok());

        let mut req = request();
        req.policy_version = Digest::sha256(b"other");
        assert!(matches!(
            guard("peer").check(&req),
            Err(DelegationError::PolicyVersionMismatch { .. })
        ));

        let mut req = request();
        req.depth = 5;
        assert!(matches!(
            guard("peer").check(&req),
            Err(DelegationError::DepthExceeded { depth: 5, max: 5 })
        ));
    }

    #[test]
    fn test_guard_rejects_tampered_pack() {
        let mut req = request();
        req.graph_data = br#"{"nodes":[],"edges":[]}"#.to_vec();
        let err = guard("peer").check(&req).unwrap_err();
        assert!(matches!(err, DelegationError::PackIntegrity(_)));
        assert_eq!(err.kind(), ErrorKind::DelegationRejected);
    }

    #[test]
    fn test_forward_extends_chain() {
        let middle = delegator("middle", Arc::new(Scripted::new(vec![])), &[]);
        let mut incoming = request();
        incoming.session = Some(Uuid::new_v4());
        let next = middle.forward(&incoming).unwrap();
        assert_eq!(next.chain, vec![node("origin"), node("middle")]);
        assert_eq!(next.depth, 2);
        assert_eq!(next.session, None);
        assert_eq!(next.origin_signature, incoming.origin_signature);
        assert!(guard("middle").check(&next).is_err());
        assert!(guard("last").check(&next).is_ok());
    }

    #[test]
    fn test_request_json_roundtrip() {
        let req = request();
        let text = serde_json::to_string(&req).unwrap();
        let back: DelegationRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(back, req);
        assert!(guard("peer").check(&back).is_ok());
    }

    #[test]
    fn test_receiver_admits_authenticated_request() {
        let receiving = Receiving::new("peer");
        let mut req = request();
        req.session = Some(receiving.session("origin"));
        assert_eq!(receiving.receiver.receive(&req).unwrap(), node("origin"));
        assert_eq!(
            receiving.audit.names(),
            vec!["delegation.received", "delegation.accepted"]
        );
    }

    #[test]
    fn test_receiver_admits_forwarded_request_from_last_hop() {
        let receiving = Receiving::new("last");
        let middle = delegator("middle", Arc::new(Scripted::new(vec![])), &[]);
        let mut next = middle.forward(&request()).unwrap();
        next.session = Some(receiving.session("middle"));
        assert_eq!(receiving.receiver.receive(&next).unwrap(), node("middle"));
    }

    #[test]
    fn test_request_without_live_session_rejected() {
        let receiving = Receiving::new("peer");
        let req = request();
        assert!(matches!(
            receiving.receiver.receive(&req),
            Err(DelegationError::MissingSession)
        ));

        let mut req = request();
        req.session = Some(Uuid::new_v4());
        assert!(matches!(
            receiving.receiver.receive(&req),
            Err(DelegationError::Session(HandshakeError::InvalidSession))
        ));
        assert_eq!(
            receiving.audit.names(),
            vec![
                "delegation.received",
                "delegation.rejected",
                "delegation.received",
                "delegation.rejected"
            ]
        );
    }

    #[test]
    fn test_spoofed_origin_rejected() {
        let receiving = Receiving::new("peer");
        let mallory = receiving.session("mallory");

        // Relaying someone else's request as if it came straight from them.
        let mut relayed = request();
        relayed.session = Some(mallory);
        assert!(matches!(
            receiving.receiver.receive(&relayed),
            Err(DelegationError::SenderMismatch { session, claimed })
                if session == node("mallory") && claimed == node("origin")
        ));

        // Claiming an origin without its key.
        let mut forged = request();
        forged.chain.push(node("mallory"));
        forged.depth = 2;
        forged.inputs = json!({"q": 2});
        resign(&mut forged, "mallory");
        forged.session = Some(mallory);
        assert!(matches!(
            receiving.receiver.receive(&forged),
            Err(DelegationError::BadOriginSignature { origin }) if origin == node("origin")
        ));

        // Trimming the chain without lowering the depth.
        let mut trimmed = request();
        trimmed.chain = vec![node("origin"), node("mallory")];
        trimmed.depth = 4;
        trimmed.session = Some(mallory);
        assert!(matches!(
            receiving.receiver.receive(&trimmed),
            Err(DelegationError::MalformedChain { .. })
        ));
        assert!(!receiving.quarantine.is_quarantined(&node("origin")));
    }

    #[test]
    fn test_spec_mismatch_quarantines_origin() {
        let receiving = Receiving::new("peer");
        let session = receiving.session("origin");
        let mut req = request();
        req.spec_version = Version::new(2, 0, 0);
        resign(&mut req, "origin");
        req.session = Some(session);
        assert!(matches!(
            receiving.receiver.receive(&req),
            Err(DelegationError::SpecVersionMismatch { .. })
        ));
        assert_eq!(
            receiving.quarantine.reason(&node("origin")),
            Some(QuarantineReason::SpecIncompatible)
        );

        let mut good = request();
        good.session = Some(session);
        assert!(matches!(
            receiving.receiver.receive(&good),
            Err(DelegationError::Quarantined { node: n }) if n == node("origin")
        ));
    }

    #[test]
    fn test_unsigned_mismatch_cannot_quarantine_origin() {
        let receiving = Receiving::new("peer");
        let mut req = request();
        req.spec_version = Version::new(2, 0, 0);
        req.session = Some(receiving.session("origin"));
        assert!(matches!(
            receiving.receiver.receive(&req),
            Err(DelegationError::BadOriginSignature { .. })
        ));
        assert!(!receiving.quarantine.is_quarantined(&node("origin")));
    }

    #[test]
    fn test_repeated_pack_failures_quarantine() {
        let receiving = Receiving::new("peer");
        let session = receiving.session("origin");
        let threshold = QuarantineConfig::default().failure_threshold;
        for _ in 0..=threshold {
            let mut req = request();
            req.graph_data = br#"{"nodes":[],"edges":[]}"#.to_vec();
            req.session = Some(session);
            assert!(matches!(
                receiving.receiver.receive(&req),
                Err(DelegationError::PackIntegrity(_))
            ));
        }
        assert!(matches!(
            receiving.quarantine.reason(&node("origin")),
            Some(QuarantineReason::RepeatedFailures { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retried() {
        let transport = Arc::new(Scripted::new(vec![
            TransportError::ConnectionRefused("down".into()),
            TransportError::Timeout(10),
        ]));
        let delegator = delegator("origin", transport.clone(), &["peer"]);
        let req = request();
        let response = delegator.delegate(&node("peer"), &req).await.unwrap();
        assert_eq!(response.request_id, req.request_id);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            delegator.breakers().state(&node("peer")),
            BreakerState::Closed { failures: 0 }
        );
        let sessions = transport.sessions.lock().unwrap().clone();
        assert!(sessions.iter().all(Option::is_some));
        assert_eq!(req.session, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_not_retried() {
        let transport = Arc::new(Scripted::new(vec![TransportError::Rejected("no".into())]));
        let delegator = delegator("origin", transport.clone(), &["peer"]);
        let err = delegator.delegate(&node("peer"), &request()).await.unwrap_err();
        assert!(matches!(err, DelegationError::Transport { attempts: 1, .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert!(!err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_bounded() {
        let transport = Arc::new(Scripted::new(vec![
            TransportError::Timeout(1),
            TransportError::Timeout(1),
            TransportError::Timeout(1),
            TransportError::Timeout(1),
        ]));
        let delegator = delegator("origin", transport.clone(), &["peer"]);
        let err = delegator.delegate(&node("peer"), &request()).await.unwrap_err();
        assert!(matches!(err, DelegationError::Transport { attempts: 3, .. }));
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_peer_times_out_and_opens_breaker() {
        let delegator = delegator("origin", Arc::new(Hanging), &["peer"]);
        let req = request();
        let peer = node("peer");
        let err = delegator.delegate(&peer, &req).await.unwrap_err();
        assert!(matches!(
            err,
            DelegationError::Transport {
                source: TransportError::Timeout(5_000),
                ..
            }
        ));
        assert_eq!(delegator.breakers().state(&peer), BreakerState::Closed { failures: 3 });

        let _ = delegator.delegate(&peer, &req).await;
        let err = delegator.delegate(&peer, &req).await.unwrap_err();
        assert!(matches!(err, DelegationError::CircuitOpen(_)));
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        // Transport trouble alone is the breaker's business.
        assert!(!delegator.quarantine().is_quarantined(&peer));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tampered_result_quarantines_peer() {
        let delegator = delegator("origin", Arc::new(Tampering), &["peer"]);
        let peer = node("peer");
        let err = delegator.delegate(&peer, &request()).await.unwrap_err();
        assert!(matches!(err, DelegationError::InvalidResult { .. }));
        assert_eq!(err.kind(), ErrorKind::IntegrityFailure);
        assert_eq!(
            delegator.quarantine().reason(&peer),
            Some(QuarantineReason::ReplayMismatch)
        );
        assert_eq!(delegator.reputation().snapshot(&peer).replay_mismatches, 1);

        let err = delegator.delegate(&peer, &request()).await.unwrap_err();
        assert!(matches!(err, DelegationError::Quarantined { .. }));
    }

    #[tokio::test]
    async fn test_refuses_to_send_back_into_chain() {
        let delegator = delegator("origin", Arc::new(Scripted::new(vec![])), &["origin"]);
        let err = delegator
            .delegate(&node("origin"), &request())
            .await
            .unwrap_err();
        assert!(matches!(err, DelegationError::RecursiveOrigin { .. }));
    }

    #[tokio::test]
    async fn test_no_session_no_delegation() {
        let transport = Arc::new(Scripted::new(vec![]));
        let delegator = delegator("origin", transport.clone(), &[]);
        let err = delegator.delegate(&node("peer"), &request()).await.unwrap_err();
        assert!(matches!(err, DelegationError::NoSession { .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_select_peer_by_reputation() {
        let delegator = delegator(
            "origin",
            Arc::new(Scripted::new(vec![])),
            &["peer-a", "peer-b", "peer-c"],
        );
        let req = request();
        let peers: Vec<NodeId> = ["peer-a", "peer-b", "peer-c", "peer-d", "origin"]
            .iter()
            .map(|id| node(id))
            .collect();
        assert_eq!(delegator.select_peer(&peers, &req), Some(node("peer-a")));

        delegator
            .quarantine()
            .quarantine(&node("peer-a"), QuarantineReason::SpecIncompatible);
        delegator
            .reputation()
            .record_failure(&node("peer-b"), FailureReason::PolicyDenied);
        assert_eq!(delegator.select_peer(&peers, &req), Some(node("peer-c")));

        let response = delegator.delegate_to_best(&peers, &req).await.unwrap();
        assert_eq!(response.request_id, req.request_id);
        assert_eq!(delegator.reputation().snapshot(&node("peer-c")).delegations_succeeded, 1);

        assert!(matches!(
            delegator.delegate_to_best(&peers[3..], &req).await,
            Err(DelegationError::NoCandidate)
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_with_real_session() {
        let receiving = Receiving::new("peer");
        let session = receiving.session("origin");
        let delegator = Delegator::new(
            guard("origin"),
            Arc::new(signer("origin")),
            config(),
            Arc::new(Loopback { receiving }),
        );
        let peer = node("peer");
        let req = delegator
            .originate(pack(), GRAPH.to_vec(), json!({"q": 1}))
            .unwrap();
        delegator.register_session(peer.clone(), &SessionToken {
            token: session,
            node_id: node("origin"),
            issued_at_ms: 1_000,
            expires_at_ms: u64::MAX,
        });
        let response = delegator.delegate(&peer, &req).await.unwrap();
        assert_eq!(response.request_id, req.request_id);
    }

    #[tokio::test]
    async fn test_fan_out_to_peers() {
        let ids = ["peer-0", "peer-1", "peer-2", "peer-3"];
        let delegator = Arc::new(delegator("origin", Arc::new(Scripted::new(vec![])), &ids));
        let req = request();
        let peers: Vec<NodeId> = ids.iter().map(|id| node(id)).collect();
        let results = futures::future::join_all(
            peers.iter().map(|peer| delegator.delegate(peer, &req)),
        )
        .await;
        let fingerprints: Vec<Digest> = results
            .into_iter()
            .map(|r| r.unwrap().manifest.fingerprint)
            .collect();
        assert!(fingerprints.windows(2).all(|w| w[0] == w[1]));
    }
}
