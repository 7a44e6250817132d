//! Replay error types.
//!
//! A divergence is not an error: it is a normal replay outcome reported in
//! [`crate::ReplayReport`]. Errors here mean replay could not be carried out.

use crate::state::ReplayPhase;
use verity_core::{CanonicalError, Classify, Digest, ErrorKind, Version};
use verity_log::{LogError, ManifestError, NdjsonError};

/// Errors raised by an execution engine while applying events
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Stored sequence numbers skip a value
    #[error("sequence gap: expected seq {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },
    /// Stored log does not start at seq 0
    #[error("stored log starts at seq {got}, expected 0")]
    SequenceStart { got: u64 },
    /// Stored sequence numbers went backwards or repeated
    #[error("seq {got} does not follow {previous}")]
    NonMonotonicSeq { previous: u64, got: u64 },
    /// A tool call never received its recorded result
    #[error("tool call {call_id} at seq {seq} has no recorded result")]
    UnpairedToolCall { call_id: String, seq: u64 },
    /// A tool result with no matching call
    #[error("tool result {call_id} at seq {seq} has no matching call")]
    UnexpectedToolResult { call_id: String, seq: u64 },
    /// Payload lacks a field the event type requires
    #[error("malformed {kind} payload at seq {seq}: {reason}")]
    MalformedPayload {
        seq: u64,
        kind: String,
        reason: String,
    },
    /// Engine used after close
    #[error("engine is closed")]
    Closed,
}

/// Replay errors
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// Replay engine version differs from the recorded one
    #[error("engine version mismatch: run recorded with {expected}, replay engine is {actual}")]
    EngineVersionMismatch { expected: Version, actual: Version },
    /// Supplied policy bundle differs from the pinned one
    #[error("policy version mismatch: run pinned {expected}, supplied {actual}")]
    PolicyVersionMismatch { expected: Digest, actual: Digest },
    /// Replay ran past its time limit
    #[error("replay timed out after {elapsed_ms}ms (limit {limit_ms}ms) at event {index}")]
    Timeout {
        elapsed_ms: u64,
        limit_ms: u64,
        index: usize,
    },
    /// Illegal state machine step
    #[error("invalid replay transition {from:?} -> {to:?}")]
    InvalidTransition { from: ReplayPhase, to: ReplayPhase },
    /// Engine rejected an event
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    /// Determinism harness needs at least two trials
    #[error("determinism check needs at least 2 runs, got {0}")]
    TooFewRuns(usize),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Ndjson(#[from] NdjsonError),
    #[error("canonical encoding failed: {0}")]
    Canonical(#[from] CanonicalError),
}

impl Classify for ReplayError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::EngineVersionMismatch { .. } | Self::PolicyVersionMismatch { .. } => {
                ErrorKind::VersionMismatch
            }
            Self::Timeout { .. } => ErrorKind::Transient,
            Self::InvalidTransition { .. } => ErrorKind::Internal,
            Self::Manifest(err) => err.kind(),
            Self::Engine(_)
            | Self::TooFewRuns(_)
            | Self::Log(_)
            | Self::Ndjson(_)
            | Self::Canonical(_) => ErrorKind::Invalid,
        }
    }
}
