//! Execution engines used to re-apply a stored event log.
//!
//! An engine applies each event's recorded effect and re-emits the event.
//! Tool calls are never re-invoked: their results are served from the
//! stored `tool_result` events. Engines are chosen by [`EngineKind`] in
//! configuration, never by inspecting a concrete type.

use crate::error::EngineError;
use crate::state::{PendingCall, ReplayState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use verity_core::{Digest, Version};
use verity_log::{Event, EventKind};

/// Available engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Re-applies events, renumbering sequence from zero. Stored sequence
    /// numbers must start at zero and strictly increase.
    #[default]
    Reference,
    /// Reference semantics plus pairing and gap checks
    Strict,
}

impl EngineKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::Strict => "strict",
        }
    }
}

/// Engine health snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineHealth {
    pub kind: EngineKind,
    pub engine_version: Version,
    pub ready: bool,
    pub events_applied: u64,
}

/// What an engine produced once closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub events: Vec<Event>,
    pub output: Value,
    pub state: ReplayState,
}

impl ExecutionOutput {
    /// Artifact CIDs, sorted
    #[must_use]
    pub fn artifact_cids(&self) -> Vec<Digest> {
        self.state.artifact_cids()
    }
}

/// Capability interface for replay engines
pub trait ExecutionEngine: Send {
    fn kind(&self) -> EngineKind;

    /// Version this instance is pinned to
    fn engine_version(&self) -> Version;

    /// Apply one stored event
    ///
    /// # Errors
    ///
    /// Returns error if the event cannot be applied
    fn execute(&mut self, event: &Event) -> Result<(), EngineError>;

    fn health(&self) -> EngineHealth;

    /// Finish and hand back the re-emitted log
    ///
    /// # Errors
    ///
    /// Returns error if the engine is already closed or the log is incomplete
    fn close(&mut self) -> Result<ExecutionOutput, EngineError>;
}

/// Build the engine selected by `kind`
#[must_use]
pub fn create_engine(kind: EngineKind, engine_version: Version) -> Box<dyn ExecutionEngine> {
    match kind {
        EngineKind::Reference => Box::new(ReferenceEngine::new(engine_version)),
        EngineKind::Strict => Box::new(StrictEngine::new(engine_version)),
    }
}

fn malformed(event: &Event, reason: &str) -> EngineError {
    EngineError::MalformedPayload {
        seq: event.seq,
        kind: event.kind.to_string(),
        reason: reason.to_string(),
    }
}

fn required_str<'a>(event: &'a Event, field: &str) -> Result<&'a str, EngineError> {
    event
        .str_field(field)
        .ok_or_else(|| malformed(event, &format!("missing string field `{field}`")))
}

/// Reference engine
#[derive(Debug)]
pub struct ReferenceEngine {
    engine_version: Version,
    state: ReplayState,
    emitted: Vec<Event>,
    last_stored_seq: Option<u64>,
    closed: bool,
}

impl ReferenceEngine {
    #[must_use]
    pub fn new(engine_version: Version) -> Self {
        Self {
            engine_version,
            state: ReplayState::new(),
            emitted: Vec::new(),
            last_stored_seq: None,
            closed: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> &ReplayState {
        &self.state
    }

    /// Sequence number the next re-emitted event receives
    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.emitted.len() as u64
    }

    fn check_order(&self, event: &Event) -> Result<(), EngineError> {
        match self.last_stored_seq {
            None if event.seq != 0 => Err(EngineError::SequenceStart { got: event.seq }),
            Some(previous) if event.seq <= previous => Err(EngineError::NonMonotonicSeq {
                previous,
                got: event.seq,
            }),
            _ => Ok(()),
        }
    }

    fn apply(&mut self, event: &Event) -> Result<(), EngineError> {
        match &event.kind {
            EventKind::StateTransition => {
                let key = required_str(event, "key")?.to_string();
                let value = event.field("value").cloned().unwrap_or(Value::Null);
                self.state.values.insert(key, value);
            }
            EventKind::ToolCall => {
                let call_id = required_str(event, "call_id")?.to_string();
                let tool = required_str(event, "tool")?.to_string();
                self.state.pending_calls.insert(
                    call_id,
                    PendingCall {
                        tool,
                        seq: event.seq,
                    },
                );
            }
            EventKind::ToolResult => {
                let call_id = required_str(event, "call_id")?.to_string();
                self.state.pending_calls.shift_remove(&call_id);
                let response = event.field("response").cloned().unwrap_or(Value::Null);
                self.state.responses.insert(call_id, response);
            }
            EventKind::Artifact => {
                let name = required_str(event, "name")?.to_string();
                let cid = Digest::from_hex(required_str(event, "cid")?)
                    .map_err(|e| malformed(event, &e.to_string()))?;
                self.state.artifacts.push((name, cid));
            }
            EventKind::RunCompleted => {
                self.state.output = Some(event.field("output").cloned().unwrap_or(Value::Null));
            }
            _ => {}
        }
        Ok(())
    }
}

impl ExecutionEngine for ReferenceEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Reference
    }

    fn engine_version(&self) -> Version {
        self.engine_version
    }

    fn execute(&mut self, event: &Event) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        self.check_order(event)?;
        self.apply(event)?;
        self.last_stored_seq = Some(event.seq);
        let seq = self.next_seq();
        self.emitted
            .push(Event::new(seq, event.kind.clone()).with_payload(event.payload.clone()));
        self.state.events_applied += 1;
        Ok(())
    }

    fn health(&self) -> EngineHealth {
        EngineHealth {
            kind: self.kind(),
            engine_version: self.engine_version,
            ready: !self.closed,
            events_applied: self.state.events_applied,
        }
    }

    fn close(&mut self) -> Result<ExecutionOutput, EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        self.closed = true;
        let state = std::mem::take(&mut self.state);
        Ok(ExecutionOutput {
            events: std::mem::take(&mut self.emitted),
            output: state.output.clone().unwrap_or(Value::Null),
            state,
        })
    }
}

/// Strict engine: rejects sequence gaps, results without calls, and calls
/// left unanswered at close
#[derive(Debug)]
pub struct StrictEngine {
    inner: ReferenceEngine,
}

impl StrictEngine {
    #[must_use]
    pub fn new(engine_version: Version) -> Self {
        Self {
            inner: ReferenceEngine::new(engine_version),
        }
    }
}

impl ExecutionEngine for StrictEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Strict
    }

    fn engine_version(&self) -> Version {
        self.inner.engine_version
    }

    fn execute(&mut self, event: &Event) -> Result<(), EngineError> {
        let expected = self.inner.next_seq();
        if event.seq != expected {
            return Err(EngineError::SequenceGap {
                expected,
                got: event.seq,
            });
        }
        if event.kind == EventKind::ToolResult {
            let call_id = required_str(event, "call_id")?;
            if !self.inner.state().pending_calls.contains_key(call_id) {
                return Err(EngineError::UnexpectedToolResult {
                    call_id: call_id.to_string(),
                    seq: event.seq,
                });
            }
        }
        self.inner.execute(event)
    }

    fn health(&self) -> EngineHealth {
        EngineHealth {
            kind: self.kind(),
            ..self.inner.health()
        }
    }

    fn close(&mut self) -> Result<ExecutionOutput, EngineError> {
        if let Some((call_id, pending)) = self.inner.state().pending_calls.first() {
            return Err(EngineError::UnpairedToolCall {
                call_id: call_id.clone(),
                seq: pending.seq,
            });
        }
        self.inner.close()
    }
}
