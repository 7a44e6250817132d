//! Quarantined nodes.
//!
//! A quarantined node is neither sent work nor allowed to hand work in.
//! Quarantine is sticky: it lasts until an operator releases the node,
//! unlike the circuit breaker, which recovers on its own.

use crate::audit::{AuditEvent, AuditSink, TracingAuditSink};
use crate::config::QuarantineConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use verity_core::NodeId;

/// Why a node was quarantined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum QuarantineReason {
    /// Sent a request for an incompatible spec major version
    SpecIncompatible,
    /// Too many rejected requests
    RepeatedFailures { failures: u32 },
    /// Returned a result that does not reproduce
    ReplayMismatch,
    /// Trust score fell below the configured floor
    LowTrust { score: u32 },
}

#[derive(Debug, Default)]
struct Ledger {
    quarantined: BTreeMap<NodeId, QuarantineReason>,
    failures: BTreeMap<NodeId, u32>,
}

/// Shared set of quarantined nodes
#[derive(Debug)]
pub struct QuarantineSet {
    config: QuarantineConfig,
    ledger: RwLock<Ledger>,
    audit: Arc<dyn AuditSink>,
}

impl QuarantineSet {
    #[must_use]
    pub fn new(config: QuarantineConfig) -> Self {
        Self {
            config,
            ledger: RwLock::new(Ledger::default()),
            audit: Arc::new(TracingAuditSink),
        }
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn config(&self) -> &QuarantineConfig {
        &self.config
    }

    #[must_use]
    pub fn is_quarantined(&self, node: &NodeId) -> bool {
        self.reason(node).is_some()
    }

    #[must_use]
    pub fn reason(&self, node: &NodeId) -> Option<QuarantineReason> {
        self.ledger
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .quarantined
            .get(node)
            .copied()
    }

    /// Quarantine `node`. The first reason recorded is kept.
    pub fn quarantine(&self, node: &NodeId, reason: QuarantineReason) {
        let newly = {
            let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);
            if ledger.quarantined.contains_key(node) {
                false
            } else {
                ledger.quarantined.insert(node.clone(), reason);
                true
            }
        };
        if newly {
            tracing::warn!(node = %node, reason = ?reason, "node quarantined");
            self.audit.record(&AuditEvent::NodeQuarantined {
                node: node.clone(),
                reason,
            });
        }
    }

    /// Count a rejected request from `node`. Quarantines the node once the
    /// count passes the configured threshold. Returns whether the node is
    /// now quarantined.
    pub fn record_failure(&self, node: &NodeId) -> bool {
        let failures = {
            let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);
            let count = ledger.failures.entry(node.clone()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        if failures > self.config.failure_threshold {
            self.quarantine(node, QuarantineReason::RepeatedFailures { failures });
        }
        self.is_quarantined(node)
    }

    /// Lift the quarantine and forget past failures
    pub fn release(&self, node: &NodeId) -> Option<QuarantineReason> {
        let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);
        ledger.failures.remove(node);
        let reason = ledger.quarantined.remove(node);
        if reason.is_some() {
            tracing::info!(node = %node, "node released from quarantine");
        }
        reason
    }

    /// Quarantined nodes, sorted by id
    #[must_use]
    pub fn snapshot(&self) -> Vec<(NodeId, QuarantineReason)> {
        self.ledger
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .quarantined
            .iter()
            .map(|(node, reason)| (node.clone(), *reason))
            .collect()
    }
}

impl Default for QuarantineSet {
    fn default() -> Self {
        Self::new(QuarantineConfig::default())
    }
}
