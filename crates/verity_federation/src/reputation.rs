//! Peer reputation and candidate ranking.
//!
//! Every delegation outcome is folded into a per-peer snapshot. The trust
//! score is a weighted 0-100 blend, computed in integer basis points so the
//! same history always scores the same:
//!
//! | weight | component |
//! |---|---|
//! | 45% | delegation success rate |
//! | 20% | latency (p50 against 500ms, p95 against 1200ms) |
//! | 15% | policy compliance (10 denials zero it) |
//! | 10% | spec and registry alignment (4 mismatches zero it) |
//! | 10% | replay consistency (2 mismatches zero it) |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use verity_core::NodeId;

const FULL: u64 = 10_000;

/// Why a delegation to a peer failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Transport,
    PolicyDenied,
    SpecMismatch,
    RegistryMismatch,
    ReplayMismatch,
}

/// Observed latency bounds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub p50_ms: u64,
    pub p95_ms: u64,
}

/// Delegation history of one peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationSnapshot {
    pub delegations_succeeded: u64,
    pub delegations_failed: BTreeMap<FailureReason, u64>,
    pub policy_denials: u64,
    pub spec_mismatches: u64,
    pub registry_mismatches: u64,
    pub replay_mismatches: u64,
    pub latency: LatencyStats,
}

impl ReputationSnapshot {
    fn record_success(&mut self, latency_ms: u64) {
        self.delegations_succeeded = self.delegations_succeeded.saturating_add(1);
        if latency_ms > 0 {
            if self.latency.p50_ms == 0 || latency_ms < self.latency.p50_ms {
                self.latency.p50_ms = latency_ms;
            }
            self.latency.p95_ms = self.latency.p95_ms.max(latency_ms);
        }
    }

    fn record_failure(&mut self, reason: FailureReason) {
        let count = self.delegations_failed.entry(reason).or_insert(0);
        *count = count.saturating_add(1);
        let incidents = match reason {
            FailureReason::Transport => return,
            FailureReason::PolicyDenied => &mut self.policy_denials,
            FailureReason::SpecMismatch => &mut self.spec_mismatches,
            FailureReason::RegistryMismatch => &mut self.registry_mismatches,
            FailureReason::ReplayMismatch => &mut self.replay_mismatches,
        };
        *incidents = incidents.saturating_add(1);
    }

    fn failed_total(&self) -> u64 {
        self.delegations_failed
            .values()
            .fold(0u64, |acc, n| acc.saturating_add(*n))
    }
}

/// `FULL` scaled down by `count / cap`, floored at zero
fn penalty(count: u64, cap: u64) -> u64 {
    FULL - count.min(cap) * FULL / cap
}

/// `FULL * (limit - value) / limit`, clamped to `0..=FULL`
fn headroom(value: u64, limit: u64) -> u64 {
    (limit - value.min(limit)) * FULL / limit
}

/// Trust score in `0..=100`
#[must_use]
pub fn trust_score(snapshot: &ReputationSnapshot) -> u32 {
    let total = snapshot
        .delegations_succeeded
        .saturating_add(snapshot.failed_total());
    let success = if total == 0 {
        FULL
    } else {
        u64::try_from(u128::from(snapshot.delegations_succeeded) * u128::from(FULL) / u128::from(total))
            .unwrap_or(FULL)
    };
    let latency = (headroom(snapshot.latency.p50_ms, 500) * 6
        + headroom(snapshot.latency.p95_ms, 1_200) * 4)
        / 10;
    let policy = penalty(snapshot.policy_denials, 10);
    let alignment = penalty(
        snapshot
            .spec_mismatches
            .saturating_add(snapshot.registry_mismatches),
        4,
    );
    let replay = penalty(snapshot.replay_mismatches, 2);

    let blended = (45 * success + 20 * latency + 15 * policy + 10 * alignment + 10 * replay) / 100;
    u32::try_from((blended + 50) / 100).unwrap_or(100).min(100)
}

/// Reputation of every peer this node has delegated to
#[derive(Debug, Default)]
pub struct ReputationBook {
    peers: RwLock<BTreeMap<NodeId, ReputationSnapshot>>,
}

impl ReputationBook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed delegation; returns the new trust score
    pub fn record_success(&self, peer: &NodeId, latency_ms: u64) -> u32 {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        let snapshot = peers.entry(peer.clone()).or_default();
        snapshot.record_success(latency_ms);
        trust_score(snapshot)
    }

    /// Record a failed delegation; returns the new trust score
    pub fn record_failure(&self, peer: &NodeId, reason: FailureReason) -> u32 {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        let snapshot = peers.entry(peer.clone()).or_default();
        snapshot.record_failure(reason);
        trust_score(snapshot)
    }

    /// History of `peer`; empty if never seen
    #[must_use]
    pub fn snapshot(&self, peer: &NodeId) -> ReputationSnapshot {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    /// Trust score of `peer`; unseen peers score 100
    #[must_use]
    pub fn score(&self, peer: &NodeId) -> u32 {
        trust_score(&self.snapshot(peer))
    }

    /// `peers` ordered best first: highest score, then node id
    #[must_use]
    pub fn rank<'a>(&self, peers: impl IntoIterator<Item = &'a NodeId>) -> Vec<(NodeId, u32)> {
        let mut ranked: Vec<(NodeId, u32)> = peers
            .into_iter()
            .map(|peer| (peer.clone(), self.score(peer)))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.dedup_by(|a, b| a.0 == b.0);
        ranked
    }
}
