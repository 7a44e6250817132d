//! Run manifests and fingerprints.
//!
//! A manifest is assembled once, when a run completes, from an
//! [`ExecutionContext`] and the finalized event log:
//!
//! ```text
//! input_hash     = H(canonical {env, inputs})
//! event_log_hash = H(canonical NDJSON stream)
//! artifact_hashes = sort([H(artifact) ...])
//! output_hash    = H(canonical output)
//! run_id         = H({engine_version, input_hash, policy_version})
//! fingerprint    = H({run_id, engine_version, event_log_hash})
//! ```
//!
//! `timestamp_epoch` is always zero.

use crate::event::Event;
use crate::log::{LogError, event_log_hash};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use verity_core::{
    CanonicalEncode, CanonicalError, Canonicalizer, Classify, Digest, ErrorKind, RunId, Version,
    canonical_hash,
};

/// Manifest errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    /// An input field came from a forbidden entropy source
    #[error("non-deterministic input at `{path}`: {reason}")]
    NonDeterministicInput {
        /// Path of the offending value
        path: String,
        /// What made it non-deterministic
        reason: String,
    },
    /// Event log could not be hashed
    #[error(transparent)]
    Log(#[from] LogError),
    /// Other canonical encoding failure
    #[error(transparent)]
    Canonical(CanonicalError),
    /// Stored fingerprint or run id does not match its recomputation
    #[error("{field} mismatch: expected {expected}, recomputed {actual}")]
    FingerprintMismatch {
        /// `fingerprint` or `run_id`
        field: &'static str,
        /// Stored value
        expected: String,
        /// Recomputed value
        actual: String,
    },
}

impl From<CanonicalError> for ManifestError {
    fn from(err: CanonicalError) -> Self {
        match err {
            CanonicalError::FloatInDigestPath { path } => Self::NonDeterministicInput {
                path,
                reason: "floating-point value".to_string(),
            },
            other => Self::Canonical(other),
        }
    }
}

impl Classify for ManifestError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::FingerprintMismatch { .. } => ErrorKind::IntegrityFailure,
            _ => ErrorKind::Invalid,
        }
    }
}

/// Everything a run depends on, threaded explicitly.
///
/// Environment-derived values (region, flags, seeds) must be added with
/// [`ExecutionContext::with_env`]; the fingerprint model never reads them
/// on its own.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Engine that runs the pack
    pub engine_version: Version,
    /// Digest of the policy bundle in force
    pub policy_version: Digest,
    inputs: Value,
    env: BTreeMap<String, Value>,
    codec: Canonicalizer,
}

impl ExecutionContext {
    /// Create a context with null inputs
    #[must_use]
    pub fn new(engine_version: Version, policy_version: Digest) -> Self {
        Self {
            engine_version,
            policy_version,
            inputs: Value::Null,
            env: BTreeMap::new(),
            codec: Canonicalizer::new(),
        }
    }

    /// Set the run inputs
    ///
    /// # Errors
    ///
    /// Returns error if the inputs cannot be represented as JSON
    pub fn with_inputs<T: Serialize>(mut self, inputs: &T) -> Result<Self, ManifestError> {
        self.inputs = serde_json::to_value(inputs)
            .map_err(|e| ManifestError::Canonical(CanonicalError::Serialize(e.to_string())))?;
        Ok(self)
    }

    /// Thread an environment value into the context
    ///
    /// # Errors
    ///
    /// Returns error if the value is not canonical (e.g. a float)
    pub fn with_env<T: Serialize>(mut self, key: &str, value: &T) -> Result<Self, ManifestError> {
        let value = self.codec.to_value(value).map_err(|err| match err {
            CanonicalError::FloatInDigestPath { path } => ManifestError::NonDeterministicInput {
                path: if path == "$" { format!("env.{key}") } else { format!("env.{key}.{path}") },
                reason: "floating-point value".to_string(),
            },
            other => ManifestError::Canonical(other),
        })?;
        self.env.insert(key.to_string(), value);
        Ok(self)
    }

    /// Declare an input array path as an unordered set (relative to the
    /// `{env, inputs}` document, e.g. `inputs.tags`)
    #[must_use]
    pub fn with_unordered(mut self, path: &str) -> Self {
        self.codec = self.codec.with_unordered(path);
        self
    }

    /// Run inputs as given
    #[must_use]
    pub fn inputs(&self) -> &Value {
        &self.inputs
    }

    /// Digest of the canonical `{env, inputs}` document
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::NonDeterministicInput`] if an input is a float
    pub fn input_hash(&self) -> Result<Digest, ManifestError> {
        Ok(self
            .codec
            .hash(&json!({ "env": self.env, "inputs": self.inputs }))?)
    }

    /// Content-derived run id
    ///
    /// # Errors
    ///
    /// Returns error if the inputs are not canonical
    pub fn run_id(&self) -> Result<RunId, ManifestError> {
        Ok(RunId::derive(
            &self.engine_version,
            &self.input_hash()?,
            &self.policy_version,
        )?)
    }
}

/// An artifact produced by a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// File name under `artifacts/`
    pub name: String,
    /// Content
    pub bytes: Vec<u8>,
}

impl Artifact {
    /// Create an artifact
    #[must_use]
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    /// Content identifier of the artifact bytes
    #[must_use]
    pub fn cid(&self) -> Digest {
        Digest::sha256(&self.bytes)
    }
}

/// Immutable record of a completed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Content-derived run id
    pub run_id: RunId,
    /// Engine the run was recorded with
    pub engine_version: Version,
    /// Policy bundle digest
    pub policy_version: Digest,
    /// Digest of `{env, inputs}`
    pub input_hash: Digest,
    /// Artifact CIDs in production order
    pub artifact_hashes: Vec<Digest>,
    /// Digest of the final output
    pub output_hash: Digest,
    /// Digest of the canonical NDJSON log
    pub event_log_hash: Digest,
    /// Number of events in the log
    pub event_count: u64,
    /// Always zero; excluded from every hash
    pub timestamp_epoch: u64,
    /// `H({run_id, engine_version, event_log_hash})`
    pub fingerprint: Digest,
}

impl CanonicalEncode for RunManifest {}

impl RunManifest {
    /// `H({run_id, engine_version, event_log_hash})`
    ///
    /// # Errors
    ///
    /// Returns error if canonical encoding fails
    pub fn compute_fingerprint(
        run_id: &RunId,
        engine_version: &Version,
        event_log_hash: &Digest,
    ) -> Result<Digest, CanonicalError> {
        canonical_hash(&json!({
            "run_id": run_id,
            "engine_version": engine_version,
            "event_log_hash": event_log_hash,
        }))
    }

    /// Digest of the sorted artifact hash array
    ///
    /// # Errors
    ///
    /// Returns error if canonical encoding fails
    pub fn artifact_set_hash(&self) -> Result<Digest, CanonicalError> {
        canonical_hash(&self.artifact_hashes)
    }

    /// Recompute the run id and fingerprint and compare with the stored ones
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::FingerprintMismatch`] naming the first field
    /// that does not match
    pub fn verify_fingerprint(&self) -> Result<(), ManifestError> {
        let run_id = RunId::derive(&self.engine_version, &self.input_hash, &self.policy_version)?;
        if run_id != self.run_id {
            return Err(ManifestError::FingerprintMismatch {
                field: "run_id",
                expected: self.run_id.to_string(),
                actual: run_id.to_string(),
            });
        }
        let fingerprint =
            Self::compute_fingerprint(&self.run_id, &self.engine_version, &self.event_log_hash)?;
        if fingerprint != self.fingerprint {
            return Err(ManifestError::FingerprintMismatch {
                field: "fingerprint",
                expected: self.fingerprint.to_string(),
                actual: fingerprint.to_string(),
            });
        }
        Ok(())
    }
}

/// Assemble a manifest from a context, the finalized events, the artifacts'
/// content identifiers and the run output
///
/// # Errors
///
/// Returns [`ManifestError::NonDeterministicInput`] if inputs, events or
/// output contain a value from a forbidden entropy source
pub fn build_manifest(
    context: &ExecutionContext,
    events: &[Event],
    artifact_cids: &[Digest],
    output: &Value,
) -> Result<RunManifest, ManifestError> {
    let input_hash = context.input_hash()?;
    let event_log_hash = event_log_hash(events).map_err(|err| match err {
        LogError::Canonical {
            seq,
            source: CanonicalError::FloatInDigestPath { path },
        } => ManifestError::NonDeterministicInput {
            path: format!("events[{seq}].{path}"),
            reason: "floating-point value".to_string(),
        },
        other => ManifestError::Log(other),
    })?;

    let mut artifact_hashes = artifact_cids.to_vec();
    artifact_hashes.sort();

    let output_hash = canonical_hash(output).map_err(|err| match err {
        CanonicalError::FloatInDigestPath { path } => ManifestError::NonDeterministicInput {
            path: format!("output.{path}"),
            reason: "floating-point value".to_string(),
        },
        other => ManifestError::Canonical(other),
    })?;

    let run_id = RunId::derive(&context.engine_version, &input_hash, &context.policy_version)?;
    let fingerprint =
        RunManifest::compute_fingerprint(&run_id, &context.engine_version, &event_log_hash)?;

    Ok(RunManifest {
        run_id,
        engine_version: context.engine_version,
        policy_version: context.policy_version.clone(),
        input_hash,
        artifact_hashes,
        output_hash,
        event_log_hash,
        event_count: events.len() as u64,
        timestamp_epoch: 0,
        fingerprint,
    })
}
