//! Per-peer circuit breakers.
//!
//! Transitions are a pure function of the current state, the clock reading
//! and the attempt outcome. The only shared state is one cell per peer,
//! updated under that peer's lock. Every admitted attempt is accounted
//! exactly once through its [`Permit`]; a permit dropped without an outcome
//! (a cancelled attempt) counts as a failure.

use crate::config::BreakerConfig;
use crate::error::CircuitOpen;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use verity_core::{Clock, NodeId, SystemClock};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation; counts consecutive failures
    Closed { failures: u32 },
    /// Fast-failing until the cooldown elapses
    Open { opened_at_ms: u64 },
    /// One trial decides whether to close again
    HalfOpen { trial_in_flight: bool },
}

impl Default for BreakerState {
    fn default() -> Self {
        Self::Closed { failures: 0 }
    }
}

/// Whether an attempt may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open trial
    Trial,
    Rejected { retry_after_ms: u64 },
}

/// Terminal outcome of an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl BreakerState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed { .. } => "closed",
            Self::Open { .. } => "open",
            Self::HalfOpen { .. } => "half_open",
        }
    }

    /// Decide whether an attempt starting at `now_ms` is admitted
    #[must_use]
    pub fn admit(self, now_ms: u64, config: &BreakerConfig) -> (Self, Admission) {
        match self {
            Self::Closed { .. } => (self, Admission::Allowed),
            Self::Open { opened_at_ms } => {
                let elapsed = now_ms.saturating_sub(opened_at_ms);
                if elapsed >= config.cooldown_ms {
                    (Self::HalfOpen { trial_in_flight: true }, Admission::Trial)
                } else {
                    (
                        self,
                        Admission::Rejected {
                            retry_after_ms: config.cooldown_ms - elapsed,
                        },
                    )
                }
            }
            Self::HalfOpen { trial_in_flight: true } => (
                self,
                Admission::Rejected {
                    retry_after_ms: config.cooldown_ms,
                },
            ),
            Self::HalfOpen { trial_in_flight: false } => {
                (Self::HalfOpen { trial_in_flight: true }, Admission::Trial)
            }
        }
    }

    /// Apply the outcome of an attempt. `trial` marks the half-open trial;
    /// late outcomes of attempts admitted before the breaker opened leave
    /// an open or half-open breaker unchanged.
    #[must_use]
    pub fn record(self, outcome: Outcome, trial: bool, now_ms: u64, config: &BreakerConfig) -> Self {
        match (self, outcome) {
            (Self::Closed { .. }, Outcome::Success) => Self::Closed { failures: 0 },
            (Self::Closed { failures }, Outcome::Failure) => {
                let failures = failures.saturating_add(1);
                if failures >= config.failure_threshold {
                    Self::Open {
                        opened_at_ms: now_ms,
                    }
                } else {
                    Self::Closed { failures }
                }
            }
            (Self::HalfOpen { .. }, Outcome::Success) if trial => Self::Closed { failures: 0 },
            (Self::HalfOpen { .. }, Outcome::Failure) if trial => Self::Open {
                opened_at_ms: now_ms,
            },
            (state, _) => state,
        }
    }
}

type Cell = Arc<Mutex<BreakerState>>;

/// Admission to one attempt against a peer
#[derive(Debug)]
pub struct Permit {
    peer: NodeId,
    cell: Cell,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    trial: bool,
    settled: bool,
}

impl Permit {
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    #[must_use]
    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    pub fn success(mut self) {
        self.settle(Outcome::Success);
    }

    pub fn failure(mut self) {
        self.settle(Outcome::Failure);
    }

    fn settle(&mut self, outcome: Outcome) {
        if self.settled {
            return;
        }
        self.settled = true;
        let now = self.clock.now_ms();
        let mut state = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
        let next = state.record(outcome, self.trial, now, &self.config);
        if next.as_str() != state.as_str() {
            tracing::info!(
                peer = %self.peer,
                from = state.as_str(),
                to = next.as_str(),
                "circuit breaker transition"
            );
        }
        *state = next;
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(peer = %self.peer, "attempt abandoned; counting as failure");
            self.settle(Outcome::Failure);
        }
    }
}

/// Breakers for every peer
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    peers: RwLock<HashMap<NodeId, Cell>>,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            peers: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn cell(&self, peer: &NodeId) -> Cell {
        if let Some(cell) = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
        {
            return Arc::clone(cell);
        }
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(peers.entry(peer.clone()).or_default())
    }

    /// Ask to start an attempt against `peer`
    ///
    /// # Errors
    ///
    /// Returns [`CircuitOpen`] if the breaker is open or its trial is in flight
    pub fn acquire(&self, peer: &NodeId) -> Result<Permit, CircuitOpen> {
        let cell = self.cell(peer);
        let admission = {
            let mut state = cell.lock().unwrap_or_else(PoisonError::into_inner);
            let (next, admission) = state.admit(self.clock.now_ms(), &self.config);
            if next.as_str() != state.as_str() {
                tracing::info!(peer = %peer, from = state.as_str(), to = next.as_str(), "circuit breaker transition");
            }
            *state = next;
            admission
        };
        match admission {
            Admission::Rejected { retry_after_ms } => Err(CircuitOpen {
                peer: peer.clone(),
                retry_after_ms,
            }),
            Admission::Allowed | Admission::Trial => Ok(Permit {
                peer: peer.clone(),
                cell,
                config: self.config,
                clock: Arc::clone(&self.clock),
                trial: admission == Admission::Trial,
                settled: false,
            }),
        }
    }

    /// Whether an attempt against `peer` would be admitted now. Does not
    /// change the breaker.
    #[must_use]
    pub fn would_admit(&self, peer: &NodeId) -> bool {
        let (_, admission) = self.state(peer).admit(self.clock.now_ms(), &self.config);
        !matches!(admission, Admission::Rejected { .. })
    }

    /// Current state for `peer`
    #[must_use]
    pub fn state(&self, peer: &NodeId) -> BreakerState {
        *self.cell(peer).lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of every tracked peer, sorted by node id
    #[must_use]
    pub fn snapshot(&self) -> Vec<(NodeId, BreakerState)> {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<(NodeId, BreakerState)> = peers
            .iter()
            .map(|(peer, cell)| (peer.clone(), *cell.lock().unwrap_or_else(PoisonError::into_inner)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}
