//! VERITY.FABRIC Event Log
//!
//! Insertion-ordered events, their NDJSON form, the join point for parallel
//! workers, and the run manifest whose fingerprint proves a run's identity.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Events and event kinds
pub mod event;
/// Deterministic merge of parallel worker output
pub mod join;
/// Append-only log and its hash
pub mod log;
/// Execution context and run manifests
pub mod manifest;
/// NDJSON encoding of the log
pub mod ndjson;
/// Run recorder
pub mod recorder;

pub use event::{Event, EventKind};
pub use join::{JoinError, WorkerOutput, join_worker_outputs};
pub use log::{EventLog, LogError};
pub use manifest::{Artifact, ExecutionContext, ManifestError, RunManifest, build_manifest};
pub use ndjson::{NdjsonError, RecordedEvent, decode_ndjson, encode_ndjson};
pub use recorder::{RecordedRun, RunRecorder};
