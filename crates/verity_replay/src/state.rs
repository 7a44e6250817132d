//! Replay phases and the state reconstructed from an event log.

use crate::error::ReplayError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use verity_core::Digest;

/// Replay state machine
///
/// `Loaded -> ReExecuting -> Compared -> Verified | Diverged`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPhase {
    Loaded,
    ReExecuting,
    Compared,
    Verified,
    Diverged,
}

impl ReplayPhase {
    #[must_use]
    pub const fn can_transition_to(&self, next: ReplayPhase) -> bool {
        matches!(
            (self, next),
            (Self::Loaded, Self::ReExecuting)
                | (Self::ReExecuting, Self::Compared)
                | (Self::Compared, Self::Verified | Self::Diverged)
        )
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Diverged)
    }
}

/// Tracks the current phase and rejects illegal steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTracker {
    phase: ReplayPhase,
    history: Vec<ReplayPhase>,
}

impl PhaseTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: ReplayPhase::Loaded,
            history: vec![ReplayPhase::Loaded],
        }
    }

    #[must_use]
    pub fn phase(&self) -> ReplayPhase {
        self.phase
    }

    /// Phases visited so far, in order
    #[must_use]
    pub fn history(&self) -> &[ReplayPhase] {
        &self.history
    }

    /// Move to `next`
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::InvalidTransition`] if the step is not allowed
    pub fn advance(&mut self, next: ReplayPhase) -> Result<(), ReplayError> {
        if !self.phase.can_transition_to(next) {
            return Err(ReplayError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        tracing::trace!(from = ?self.phase, to = ?next, "replay phase");
        self.phase = next;
        self.history.push(next);
        Ok(())
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// A tool call waiting for its recorded result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCall {
    pub tool: String,
    pub seq: u64,
}

/// State rebuilt by applying events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayState {
    /// State keys after every transition
    pub values: BTreeMap<String, Value>,
    /// Calls issued but not yet answered, in call order
    pub pending_calls: IndexMap<String, PendingCall>,
    /// Recorded responses by call id
    pub responses: BTreeMap<String, Value>,
    /// Artifacts in log order
    pub artifacts: Vec<(String, Digest)>,
    pub output: Option<Value>,
    pub events_applied: u64,
}

impl ReplayState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Artifact CIDs, sorted
    #[must_use]
    pub fn artifact_cids(&self) -> Vec<Digest> {
        let mut cids: Vec<Digest> = self.artifacts.iter().map(|(_, cid)| cid.clone()).collect();
        cids.sort();
        cids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut tracker = PhaseTracker::new();
        tracker.advance(ReplayPhase::ReExecuting).unwrap();
        tracker.advance(ReplayPhase::Compared).unwrap();
        tracker.advance(ReplayPhase::Verified).unwrap();
        assert!(tracker.phase().is_terminal());
        assert_eq!(tracker.history().len(), 4);
    }

    #[test]
    fn test_cannot_skip_re_execution() {
        let mut tracker = PhaseTracker::new();
        assert!(matches!(
            tracker.advance(ReplayPhase::Compared),
            Err(ReplayError::InvalidTransition {
                from: ReplayPhase::Loaded,
                to: ReplayPhase::Compared
            })
        ));
    }

    #[test]
    fn test_terminal_phases_are_final() {
        assert!(!ReplayPhase::Verified.can_transition_to(ReplayPhase::Diverged));
        assert!(!ReplayPhase::Diverged.can_transition_to(ReplayPhase::Loaded));
    }

    #[test]
    fn test_artifact_cids_sorted() {
        let mut state = ReplayState::new();
        state.artifacts.push(("b".into(), Digest::sha256(b"2")));
        state.artifacts.push(("a".into(), Digest::sha256(b"1")));
        let cids = state.artifact_cids();
        assert!(cids[0] <= cids[1]);
    }
}
