//! Determinism checks over repeated runs.

use crate::engine::ReplayEngine;
use crate::error::ReplayError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use verity_core::Digest;
use verity_log::{Event, RunManifest};
use verity_policy::CompiledBundle;

/// Fingerprints observed across repeated runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterminismReport {
    pub runs: usize,
    pub fingerprints: Vec<Digest>,
    pub deterministic: bool,
    /// First run whose fingerprint differs from run 0
    pub first_mismatch: Option<usize>,
}

impl DeterminismReport {
    fn from_fingerprints(fingerprints: Vec<Digest>) -> Self {
        let first_mismatch = fingerprints
            .iter()
            .skip(1)
            .position(|fp| Some(fp) != fingerprints.first())
            .map(|i| i + 1);
        Self {
            runs: fingerprints.len(),
            deterministic: first_mismatch.is_none(),
            first_mismatch,
            fingerprints,
        }
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.deterministic)
    }
}

/// Run `trial` `runs` times and compare the manifests' fingerprints.
/// `trial` receives the zero-based run number.
///
/// # Errors
///
/// Returns [`ReplayError::TooFewRuns`] for fewer than two runs, or the
/// first error returned by `trial`
pub fn verify_determinism<F>(runs: usize, mut trial: F) -> Result<DeterminismReport, ReplayError>
where
    F: FnMut(usize) -> Result<RunManifest, ReplayError>,
{
    if runs < 2 {
        return Err(ReplayError::TooFewRuns(runs));
    }
    let mut fingerprints = Vec::with_capacity(runs);
    for run in 0..runs {
        let manifest = trial(run)?;
        tracing::debug!(run, fingerprint = %manifest.fingerprint.short(), "determinism trial");
        fingerprints.push(manifest.fingerprint);
    }
    let report = DeterminismReport::from_fingerprints(fingerprints);
    if let Some(run) = report.first_mismatch {
        tracing::warn!(run, runs, "fingerprint differs between runs");
    }
    Ok(report)
}

/// Replay one stored run `runs` times and compare the replay fingerprints
///
/// # Errors
///
/// Returns error if fewer than two runs are requested or any replay fails
pub fn verify_replay_determinism(
    engine: &ReplayEngine,
    manifest: &RunManifest,
    events: &[Event],
    bundle: &Arc<CompiledBundle>,
    runs: usize,
) -> Result<DeterminismReport, ReplayError> {
    if runs < 2 {
        return Err(ReplayError::TooFewRuns(runs));
    }
    let mut fingerprints = Vec::with_capacity(runs);
    for _ in 0..runs {
        let report = engine.replay(manifest, events, bundle)?;
        fingerprints.push(report.replay_fingerprint);
    }
    Ok(DeterminismReport::from_fingerprints(fingerprints))
}
