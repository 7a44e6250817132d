//! Federation audit trail.
//!
//! Handshakes and delegation admissions report what happened to an
//! [`AuditSink`]. The default sink writes each event through `tracing`
//! under the `verity_federation::audit` target.

use crate::quarantine::QuarantineReason;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;
use verity_core::NodeId;

/// One audited federation event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum AuditEvent {
    #[serde(rename = "handshake.started")]
    HandshakeStarted { node: NodeId },
    #[serde(rename = "handshake.failed")]
    HandshakeFailed { node: NodeId, reason: String },
    #[serde(rename = "handshake.completed")]
    HandshakeCompleted { node: NodeId },
    #[serde(rename = "delegation.received")]
    DelegationReceived { request_id: Uuid, origin: NodeId },
    #[serde(rename = "delegation.rejected")]
    DelegationRejected {
        request_id: Uuid,
        origin: NodeId,
        reason: String,
    },
    #[serde(rename = "delegation.accepted")]
    DelegationAccepted { request_id: Uuid, origin: NodeId },
    #[serde(rename = "node.quarantined")]
    NodeQuarantined {
        node: NodeId,
        reason: QuarantineReason,
    },
}

impl AuditEvent {
    /// Dotted event name, e.g. `delegation.rejected`
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::HandshakeStarted { .. } => "handshake.started",
            Self::HandshakeFailed { .. } => "handshake.failed",
            Self::HandshakeCompleted { .. } => "handshake.completed",
            Self::DelegationReceived { .. } => "delegation.received",
            Self::DelegationRejected { .. } => "delegation.rejected",
            Self::DelegationAccepted { .. } => "delegation.accepted",
            Self::NodeQuarantined { .. } => "node.quarantined",
        }
    }
}

/// Receives audit events
pub trait AuditSink: Send + Sync + std::fmt::Debug {
    fn record(&self, event: &AuditEvent);
}

/// Writes events as structured `tracing` records
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        let detail = serde_json::to_string(event).unwrap_or_default();
        tracing::info!(target: "verity_federation::audit", event = event.name(), %detail);
    }
}

/// Keeps every event in memory, in arrival order
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Names of the events recorded so far
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(AuditEvent::name)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
