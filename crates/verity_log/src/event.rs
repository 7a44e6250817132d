//! Event types for the event log.
//!
//! Events are ordered by `seq` alone. Nothing about an event refers to
//! wall-clock time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use verity_core::CanonicalEncode;

/// Event kind, serialized as its snake_case name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    /// Payload `{engine_version, input_hash, policy_version}`
    RunStarted,
    /// A step began
    StepStarted,
    /// A step finished
    StepCompleted,
    /// Payload `{key, value}`: set a state key
    StateTransition,
    /// Payload `{call_id, tool, args}`
    ToolCall,
    /// Payload `{call_id, response}`: the recorded response of a tool call
    ToolResult,
    /// A gate verdict
    PolicyDecision,
    /// Payload `{name, cid}`
    Artifact,
    /// Payload `{output}`
    RunCompleted,
    /// Terminal failure
    RunFailed,
    /// Any other type name, preserved verbatim
    Custom(String),
}

impl EventKind {
    /// Type name as written in the log
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::RunStarted => "run_started",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StateTransition => "state_transition",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::PolicyDecision => "policy_decision",
            Self::Artifact => "artifact",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
            Self::Custom(name) => name,
        }
    }

    /// Whether the event ends a run
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::RunCompleted | Self::RunFailed)
    }
}

impl From<String> for EventKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "run_started" => Self::RunStarted,
            "step_started" => Self::StepStarted,
            "step_completed" => Self::StepCompleted,
            "state_transition" => Self::StateTransition,
            "tool_call" => Self::ToolCall,
            "tool_result" => Self::ToolResult,
            "policy_decision" => Self::PolicyDecision,
            "artifact" => Self::Artifact,
            "run_completed" => Self::RunCompleted,
            "run_failed" => Self::RunFailed,
            _ => Self::Custom(name),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single logged event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the log, from zero
    pub seq: u64,
    /// Event type, serialized as `type`
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Canonical JSON payload
    pub payload: Value,
}

impl Event {
    /// Create an event with a null payload
    #[must_use]
    pub fn new(seq: u64, kind: EventKind) -> Self {
        Self {
            seq,
            kind,
            payload: Value::Null,
        }
    }

    /// Replace the payload
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Look up a top-level payload field
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Look up a top-level string payload field
    #[must_use]
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    /// Whether this event ends the run
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

impl CanonicalEncode for Event {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serializes_type_field() {
        let event = Event::new(3, EventKind::ToolCall).with_payload(json!({"tool": "fetch"}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "tool_call");
        assert_eq!(value["seq"], 3);
    }

    #[test]
    fn test_custom_kind_preserved() {
        let event: Event =
            serde_json::from_str(r#"{"seq":0,"type":"checkpoint","payload":null}"#).unwrap();
        assert_eq!(event.kind, EventKind::Custom("checkpoint".to_string()));
        let text = String::from_utf8(event.canonical_bytes().unwrap()).unwrap();
        assert_eq!(text, r#"{"payload":null,"seq":0,"type":"checkpoint"}"#);
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(Event::new(9, EventKind::RunCompleted).is_terminal());
        assert!(Event::new(9, EventKind::RunFailed).is_terminal());
        assert!(!Event::new(9, EventKind::ToolResult).is_terminal());
    }

    #[test]
    fn test_field_access() {
        let event = Event::new(1, EventKind::ToolResult)
            .with_payload(json!({"call_id": "c1", "response": {"ok": true}}));
        assert_eq!(event.str_field("call_id"), Some("c1"));
        assert!(event.field("missing").is_none());
    }
}
