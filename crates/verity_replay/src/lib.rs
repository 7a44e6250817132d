//! VERITY.FABRIC Replay
//!
//! Re-applies stored event logs, verifies that every manifest field
//! reproduces, diagnoses divergences and diffs pairs of runs.

#![warn(clippy::all)]

pub mod diff;
pub mod engine;
pub mod error;
pub mod executor;
pub mod harness;
pub mod report;
pub mod state;

pub use diff::{Diagnosis, EventDiff, FieldMatch, RunDiff, RunView, diff_paths, diff_runs};
pub use engine::{DEFAULT_REPLAY_TIMEOUT_MS, ReplayConfig, ReplayEngine};
pub use error::{EngineError, ReplayError};
pub use executor::{
    EngineHealth, EngineKind, ExecutionEngine, ExecutionOutput, ReferenceEngine, StrictEngine,
    create_engine,
};
pub use harness::{DeterminismReport, verify_determinism, verify_replay_determinism};
pub use report::{Divergence, GateVerdict, ReplayReport, ReplayStatus};
pub use state::{PhaseTracker, ReplayPhase, ReplayState};
