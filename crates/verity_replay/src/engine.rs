//! Replay verification.
//!
//! A stored run is re-applied through an
//! [`ExecutionEngine`](crate::executor::ExecutionEngine) and every
//! manifest field is recomputed from what the engine re-emits. The stored
//! log itself is hashed too, so a log edited after recording cannot verify
//! even when its edits re-apply cleanly. Checks run in a fixed order and
//! stop at the first field that differs: `event_count`, `event_log_hash`
//! (stored, then re-emitted), `output_hash`, `artifact_hashes`,
//! `fingerprint`.

use crate::diff::{Diagnosis, diagnose_event_pair, first_divergent_index};
use crate::error::ReplayError;
use crate::executor::{EngineKind, ExecutionOutput, create_engine};
use crate::report::{Divergence, GateVerdict, ReplayReport, ReplayStatus};
use crate::state::{PhaseTracker, ReplayPhase};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use verity_core::{Clock, Digest, RunId, SystemClock, Version, canonical_hash};
use verity_log::log::event_log_hash;
use verity_log::{Event, EventKind, ManifestError, RunManifest};
use verity_policy::{CompiledBundle, GateKind, PolicyContext, PolicyGate, Verdict};

/// Default wall-clock limit for one replay
pub const DEFAULT_REPLAY_TIMEOUT_MS: u64 = 120_000;

/// Replay engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Engine used to re-apply events
    pub engine: EngineKind,
    /// Abort once replay has run this long
    pub timeout_ms: u64,
    /// Evaluate replay and post-execution gates against the pinned bundle
    pub evaluate_gates: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Reference,
            timeout_ms: DEFAULT_REPLAY_TIMEOUT_MS,
            evaluate_gates: true,
        }
    }
}

/// Replays stored runs and verifies their fingerprints
#[derive(Debug, Clone)]
pub struct ReplayEngine {
    config: ReplayConfig,
    engine_version: Version,
    clock: Arc<dyn Clock>,
}

/// Values recomputed from a re-execution
struct Recomputed {
    event_count: u64,
    stored_log_hash: Digest,
    event_log_hash: Digest,
    output_hash: Digest,
    artifact_hashes: Vec<Digest>,
    fingerprint: Digest,
}

impl ReplayEngine {
    /// Create a replay engine pinned to `engine_version`
    #[must_use]
    pub fn new(engine_version: Version) -> Self {
        Self {
            config: ReplayConfig::default(),
            engine_version,
            clock: Arc::new(SystemClock),
        }
    }

    /// Create with custom config
    #[must_use]
    pub fn with_config(mut self, config: ReplayConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `clock` for the timeout
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    #[must_use]
    pub fn engine_version(&self) -> Version {
        self.engine_version
    }

    /// Replay `events` and compare the result with `manifest`.
    ///
    /// A divergence is reported, not returned as an error.
    ///
    /// # Errors
    ///
    /// Returns error if the engine or policy version differs from the
    /// recorded one, replay times out, or the engine rejects an event
    pub fn replay(
        &self,
        manifest: &RunManifest,
        events: &[Event],
        bundle: &Arc<CompiledBundle>,
    ) -> Result<ReplayReport, ReplayError> {
        if manifest.engine_version != self.engine_version {
            return Err(ReplayError::EngineVersionMismatch {
                expected: manifest.engine_version,
                actual: self.engine_version,
            });
        }
        if bundle.policy_version() != &manifest.policy_version {
            return Err(ReplayError::PolicyVersionMismatch {
                expected: manifest.policy_version.clone(),
                actual: bundle.policy_version().clone(),
            });
        }

        let mut tracker = PhaseTracker::new();
        tracker.advance(ReplayPhase::ReExecuting)?;
        let output = self.re_execute(events)?;

        tracker.advance(ReplayPhase::Compared)?;
        let stored_log_hash = event_log_hash(events)?;
        let recomputed = self.recompute(manifest, &output, stored_log_hash, bundle.policy_version())?;
        let (divergence, diagnosis) = compare(manifest, events, &output, &recomputed)?;

        let status = if divergence.is_none() {
            tracker.advance(ReplayPhase::Verified)?;
            ReplayStatus::Verified
        } else {
            tracker.advance(ReplayPhase::Diverged)?;
            ReplayStatus::Diverged
        };

        let gates = if self.config.evaluate_gates {
            evaluate_gates(bundle, status, &recomputed.fingerprint, &manifest.fingerprint)?
        } else {
            Vec::new()
        };

        match &divergence {
            None => tracing::info!(
                run_id = %manifest.run_id,
                events = recomputed.event_count,
                "replay verified"
            ),
            Some(div) => tracing::warn!(
                run_id = %manifest.run_id,
                field = %div.field,
                index = ?div.first_divergent_event_index,
                diagnosis = diagnosis.map(|d| d.as_str()),
                "replay diverged"
            ),
        }

        Ok(ReplayReport {
            run_id: manifest.run_id.clone(),
            status,
            original_fingerprint: manifest.fingerprint.clone(),
            replay_fingerprint: recomputed.fingerprint,
            matches: status == ReplayStatus::Verified,
            divergence,
            diagnosis,
            event_count: recomputed.event_count,
            gates,
        })
    }

    fn re_execute(&self, events: &[Event]) -> Result<ExecutionOutput, ReplayError> {
        let mut engine = create_engine(self.config.engine, self.engine_version);
        let started = self.clock.now_ms();
        for (index, event) in events.iter().enumerate() {
            let elapsed_ms = self.clock.now_ms().saturating_sub(started);
            if elapsed_ms > self.config.timeout_ms {
                return Err(ReplayError::Timeout {
                    elapsed_ms,
                    limit_ms: self.config.timeout_ms,
                    index,
                });
            }
            engine.execute(event)?;
        }
        let output = engine.close()?;
        tracing::debug!(
            engine = self.config.engine.as_str(),
            events = output.events.len(),
            "re-execution finished"
        );
        Ok(output)
    }

    fn recompute(
        &self,
        manifest: &RunManifest,
        output: &ExecutionOutput,
        stored_log_hash: Digest,
        policy_version: &Digest,
    ) -> Result<Recomputed, ReplayError> {
        // Prefer the input hash the run announced in its first event.
        let input_hash = output
            .events
            .first()
            .filter(|e| e.kind == EventKind::RunStarted)
            .and_then(|e| e.str_field("input_hash"))
            .and_then(|hex| Digest::from_hex(hex).ok())
            .unwrap_or_else(|| manifest.input_hash.clone());

        let event_log_hash = event_log_hash(&output.events)?;
        let output_hash = canonical_hash(&output.output).map_err(ManifestError::from)?;
        let run_id = RunId::derive(&self.engine_version, &input_hash, policy_version)?;
        let fingerprint =
            RunManifest::compute_fingerprint(&run_id, &self.engine_version, &event_log_hash)?;

        Ok(Recomputed {
            event_count: output.events.len() as u64,
            stored_log_hash,
            event_log_hash,
            output_hash,
            artifact_hashes: output.artifact_cids(),
            fingerprint,
        })
    }
}

fn divergence(field: &str, expected: impl ToString, got: impl ToString, index: Option<usize>) -> Divergence {
    Divergence {
        field: field.to_string(),
        expected: expected.to_string(),
        got: got.to_string(),
        first_divergent_event_index: index.map(|i| i as u64),
    }
}

fn compare(
    manifest: &RunManifest,
    stored: &[Event],
    output: &ExecutionOutput,
    recomputed: &Recomputed,
) -> Result<(Option<Divergence>, Option<Diagnosis>), ReplayError> {
    if recomputed.event_count != manifest.event_count {
        let index = recomputed.event_count.min(manifest.event_count) as usize;
        return Ok((
            Some(divergence(
                "event_count",
                manifest.event_count,
                recomputed.event_count,
                Some(index),
            )),
            Some(Diagnosis::EventCountMismatch),
        ));
    }

    if recomputed.stored_log_hash != manifest.event_log_hash {
        // Points at the first stored event the engine had to renumber.
        let index = first_divergent_index(stored, &output.events)?;
        tracing::debug!(index = ?index, "stored log does not hash to the manifest");
        return Ok((
            Some(divergence(
                "event_log_hash",
                &manifest.event_log_hash,
                &recomputed.stored_log_hash,
                index,
            )),
            None,
        ));
    }

    if recomputed.event_log_hash != manifest.event_log_hash {
        let index = first_divergent_index(stored, &output.events)?;
        let diagnosis = index.and_then(|i| {
            let a = serde_json::to_value(stored.get(i)?).ok()?;
            let b = serde_json::to_value(output.events.get(i)?).ok()?;
            diagnose_event_pair(&a, &b, None)
        });
        return Ok((
            Some(divergence(
                "event_log_hash",
                &manifest.event_log_hash,
                &recomputed.event_log_hash,
                index,
            )),
            diagnosis,
        ));
    }

    if recomputed.output_hash != manifest.output_hash {
        return Ok((
            Some(divergence(
                "output_hash",
                &manifest.output_hash,
                &recomputed.output_hash,
                None,
            )),
            Some(Diagnosis::OutputNondeterministic),
        ));
    }

    if recomputed.artifact_hashes != manifest.artifact_hashes {
        let expected = manifest.artifact_set_hash()?;
        let got = canonical_hash(&recomputed.artifact_hashes)?;
        return Ok((Some(divergence("artifact_hashes", expected, got, None)), None));
    }

    if recomputed.fingerprint != manifest.fingerprint {
        return Ok((
            Some(divergence(
                "fingerprint",
                &manifest.fingerprint,
                &recomputed.fingerprint,
                None,
            )),
            None,
        ));
    }

    Ok((None, None))
}

fn evaluate_gates(
    bundle: &Arc<CompiledBundle>,
    status: ReplayStatus,
    fingerprint: &Digest,
    expected: &Digest,
) -> Result<Vec<GateVerdict>, ReplayError> {
    let gate = PolicyGate::new(Arc::clone(bundle));
    let contexts = [
        (
            GateKind::Replay,
            json!({"fingerprint": fingerprint, "expected_fingerprint": expected}),
        ),
        (
            GateKind::PostExecution,
            json!({"replay": {"status": status.as_str()}}),
        ),
    ];

    let mut verdicts = Vec::with_capacity(contexts.len());
    for (kind, value) in contexts {
        let context = PolicyContext::new(value)?;
        let evaluation = gate.evaluate(kind, &context);
        let (verdict, rule_id, message) = match evaluation.verdict {
            Verdict::Allow => ("allow", None, None),
            Verdict::Deny {
                rule_id, message, ..
            } => ("deny", Some(rule_id), Some(message)),
        };
        tracing::debug!(gate = %kind, verdict, "replay gate");
        verdicts.push(GateVerdict {
            gate: kind,
            verdict: verdict.to_string(),
            rule_id,
            message,
        });
    }
    Ok(verdicts)
}
