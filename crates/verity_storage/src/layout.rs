//! Persisted run layout.
//!
//! ```text
//! runs/<run_id>/meta.json                 run manifest
//! runs/<run_id>/logs/events.ndjson        event log, one event per line
//! runs/<run_id>/artifacts/inputs.json     run inputs
//! runs/<run_id>/artifacts/policy.json     pinned policy bundle
//! runs/<run_id>/artifacts/pack.zip        pack archive
//! runs/<run_id>/artifacts/blobs/<cid>     artifacts by content id
//! ```

use crate::error::StoreError;
use crate::kv::KvStore;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use verity_core::Digest;
use verity_log::{RecordedEvent, RecordedRun, RunManifest, decode_ndjson, encode_ndjson};

const RUNS: &str = "runs/";
pub const META_FILE: &str = "meta.json";
pub const EVENTS_FILE: &str = "logs/events.ndjson";
pub const INPUTS_FILE: &str = "artifacts/inputs.json";
pub const POLICY_FILE: &str = "artifacts/policy.json";
pub const PACK_FILE: &str = "artifacts/pack.zip";
const BLOBS_DIR: &str = "artifacts/blobs/";

/// A run read back from storage
#[derive(Debug, Clone)]
pub struct StoredRun {
    pub manifest: RunManifest,
    pub events: Vec<RecordedEvent>,
}

impl StoredRun {
    /// Events without their raw text
    #[must_use]
    pub fn plain_events(&self) -> Vec<verity_log::Event> {
        self.events.iter().map(|r| r.event.clone()).collect()
    }
}

/// Reads and writes runs through a [`KvStore`]
#[derive(Debug, Clone)]
pub struct RunRepository {
    store: Arc<dyn KvStore>,
}

fn run_key(run_id: &str, file: &str) -> String {
    format!("{RUNS}{run_id}/{file}")
}

impl RunRepository {
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.store.put(key, &bytes)
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, StoreError> {
        let bytes = self.store.get(key)?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Persist a recorded run with its inputs and pinned policy document
    ///
    /// # Errors
    ///
    /// Returns error if any write fails
    pub fn save_run(
        &self,
        run: &RecordedRun,
        inputs: &Value,
        policy: &Value,
    ) -> Result<String, StoreError> {
        let id = run.manifest.run_id.to_string();
        self.put_json(&run_key(&id, META_FILE), &run.manifest)?;
        self.store
            .put(&run_key(&id, EVENTS_FILE), encode_ndjson(&run.events)?.as_bytes())?;
        self.put_json(&run_key(&id, INPUTS_FILE), inputs)?;
        self.put_json(&run_key(&id, POLICY_FILE), policy)?;
        for artifact in &run.artifacts {
            let key = run_key(&id, &format!("{BLOBS_DIR}{}", artifact.cid()));
            self.store.put(&key, &artifact.bytes)?;
        }
        tracing::info!(run_id = %id, events = run.events.len(), "run saved");
        Ok(id)
    }

    /// Store the pack archive for a run
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn save_pack(&self, run_id: &str, archive: &[u8]) -> Result<(), StoreError> {
        self.store.put(&run_key(run_id, PACK_FILE), archive)
    }

    /// All stored run ids, sorted
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be listed
    pub fn list_runs(&self) -> Result<Vec<String>, StoreError> {
        let ids: BTreeSet<String> = self
            .store
            .list(RUNS)?
            .into_iter()
            .filter_map(|key| {
                let rest = key.strip_prefix(RUNS)?;
                let (id, file) = rest.split_once('/')?;
                (file == META_FILE).then(|| id.to_string())
            })
            .collect();
        Ok(ids.into_iter().collect())
    }

    /// Resolve a full id or a unique prefix of one
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if nothing matches and
    /// [`StoreError::AmbiguousRunId`] if several runs match
    pub fn resolve(&self, id_or_prefix: &str) -> Result<String, StoreError> {
        let matches: Vec<String> = self
            .list_runs()?
            .into_iter()
            .filter(|id| id.starts_with(id_or_prefix))
            .collect();
        match matches.as_slice() {
            [one] => Ok(one.clone()),
            [] => Err(StoreError::NotFound {
                key: run_key(id_or_prefix, META_FILE),
            }),
            many => {
                if let Some(exact) = many.iter().find(|id| *id == id_or_prefix) {
                    return Ok(exact.clone());
                }
                Err(StoreError::AmbiguousRunId {
                    prefix: id_or_prefix.to_string(),
                    matches: many.len(),
                })
            }
        }
    }

    /// # Errors
    ///
    /// Returns error if the manifest is missing or malformed
    pub fn load_manifest(&self, run_id: &str) -> Result<RunManifest, StoreError> {
        self.get_json(&run_key(run_id, META_FILE))
    }

    /// Load the event log keeping each line's raw text
    ///
    /// # Errors
    ///
    /// Returns error if the log is missing or a line does not decode
    pub fn load_events(&self, run_id: &str) -> Result<Vec<RecordedEvent>, StoreError> {
        let key = run_key(run_id, EVENTS_FILE);
        let bytes = self.store.get(&key)?;
        let text = String::from_utf8(bytes).map_err(|e| StoreError::Serialization {
            key,
            reason: e.to_string(),
        })?;
        Ok(decode_ndjson(&text)?)
    }

    /// Load manifest and events together
    ///
    /// # Errors
    ///
    /// Returns error if either is missing or malformed
    pub fn load_run(&self, run_id: &str) -> Result<StoredRun, StoreError> {
        Ok(StoredRun {
            manifest: self.load_manifest(run_id)?,
            events: self.load_events(run_id)?,
        })
    }

    /// # Errors
    ///
    /// Returns error if the inputs are missing or malformed
    pub fn load_inputs(&self, run_id: &str) -> Result<Value, StoreError> {
        self.get_json(&run_key(run_id, INPUTS_FILE))
    }

    /// Pinned policy document
    ///
    /// # Errors
    ///
    /// Returns error if the policy is missing or malformed
    pub fn load_policy(&self, run_id: &str) -> Result<Value, StoreError> {
        self.get_json(&run_key(run_id, POLICY_FILE))
    }

    /// # Errors
    ///
    /// Returns error if no pack was stored
    pub fn load_pack(&self, run_id: &str) -> Result<Vec<u8>, StoreError> {
        self.store.get(&run_key(run_id, PACK_FILE))
    }

    /// Artifact bytes by content id
    ///
    /// # Errors
    ///
    /// Returns error if the artifact is missing
    pub fn load_artifact(&self, run_id: &str, cid: &Digest) -> Result<Vec<u8>, StoreError> {
        self.store.get(&run_key(run_id, &format!("{BLOBS_DIR}{cid}")))
    }

    /// Remove every key of a run; returns how many were removed
    ///
    /// # Errors
    ///
    /// Returns error if listing or deleting fails
    pub fn delete_run(&self, run_id: &str) -> Result<usize, StoreError> {
        let mut removed = 0;
        for key in self.store.list(&format!("{RUNS}{run_id}/"))? {
            if self.store.delete(&key)? {
                removed += 1;
            }
        }
        tracing::info!(run_id, removed, "run deleted");
        Ok(removed)
    }
}
