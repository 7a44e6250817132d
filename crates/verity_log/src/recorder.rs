//! Records a run as it executes and seals it into a manifest.

use crate::event::{Event, EventKind};
use crate::log::{EventLog, LogError};
use crate::manifest::{Artifact, ExecutionContext, ManifestError, RunManifest, build_manifest};
use serde_json::{Value, json};
use verity_core::Digest;

/// A sealed run: its manifest, events and artifacts
#[derive(Debug, Clone)]
pub struct RecordedRun {
    /// Sealed manifest
    pub manifest: RunManifest,
    /// Events in append order
    pub events: Vec<Event>,
    /// Artifacts in production order
    pub artifacts: Vec<Artifact>,
    /// Final output
    pub output: Value,
}

/// Builder that appends events in execution order
#[derive(Debug)]
pub struct RunRecorder {
    context: ExecutionContext,
    log: EventLog,
    artifacts: Vec<Artifact>,
}

impl RunRecorder {
    /// Start recording; emits `run_started` carrying the input hash
    ///
    /// # Errors
    ///
    /// Returns error if the context inputs are not canonical
    pub fn start(context: ExecutionContext) -> Result<Self, ManifestError> {
        let input_hash = context.input_hash()?;
        let mut log = EventLog::new();
        log.append(
            EventKind::RunStarted,
            json!({
                "engine_version": context.engine_version,
                "input_hash": input_hash,
                "policy_version": context.policy_version,
            }),
        )?;
        Ok(Self {
            context,
            log,
            artifacts: Vec::new(),
        })
    }

    /// Context the run was started with
    #[must_use]
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Events recorded so far
    #[must_use]
    pub fn events(&self) -> &[Event] {
        self.log.events()
    }

    /// Append an arbitrary event
    ///
    /// # Errors
    ///
    /// Returns error if the log has no sequence number left
    pub fn record(&mut self, kind: EventKind, payload: Value) -> Result<u64, LogError> {
        self.log.append(kind, payload)
    }

    /// Set a state key
    ///
    /// # Errors
    ///
    /// Returns error if the log has no sequence number left
    pub fn state(&mut self, key: &str, value: Value) -> Result<u64, LogError> {
        self.record(EventKind::StateTransition, json!({"key": key, "value": value}))
    }

    /// Record a tool invocation and its response
    ///
    /// # Errors
    ///
    /// Returns error if the log has no sequence number left
    pub fn tool_call(
        &mut self,
        call_id: &str,
        tool: &str,
        args: Value,
        response: Value,
    ) -> Result<u64, LogError> {
        self.record(
            EventKind::ToolCall,
            json!({"call_id": call_id, "tool": tool, "args": args}),
        )?;
        self.record(
            EventKind::ToolResult,
            json!({"call_id": call_id, "response": response}),
        )
    }

    /// Record an artifact; its content identifier goes into the log
    ///
    /// # Errors
    ///
    /// Returns error if the log has no sequence number left
    pub fn artifact(&mut self, artifact: Artifact) -> Result<Digest, LogError> {
        let cid = artifact.cid();
        self.record(
            EventKind::Artifact,
            json!({"name": artifact.name, "cid": cid}),
        )?;
        self.artifacts.push(artifact);
        Ok(cid)
    }

    /// Emit `run_completed` and build the manifest
    ///
    /// # Errors
    ///
    /// Returns error if any recorded value is not canonical
    pub fn complete(mut self, output: Value) -> Result<RecordedRun, ManifestError> {
        self.record(EventKind::RunCompleted, json!({"output": output}))?;
        let cids: Vec<Digest> = self.artifacts.iter().map(Artifact::cid).collect();
        let manifest = build_manifest(&self.context, self.log.events(), &cids, &output)?;
        tracing::debug!(
            run_id = %manifest.run_id,
            fingerprint = %manifest.fingerprint.short(),
            events = manifest.event_count,
            "run sealed"
        );
        Ok(RecordedRun {
            manifest,
            events: self.log.into_events(),
            artifacts: self.artifacts,
            output,
        })
    }
}
