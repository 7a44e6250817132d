//! Replay verdicts.

use crate::diff::Diagnosis;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use verity_core::{Digest, RunId};
use verity_policy::GateKind;

/// Overall replay outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStatus {
    Verified,
    Diverged,
}

impl ReplayStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Diverged => "diverged",
        }
    }
}

impl fmt::Display for ReplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First manifest field that did not reproduce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Divergence {
    pub field: String,
    pub expected: String,
    pub got: String,
    pub first_divergent_event_index: Option<u64>,
}

/// A policy gate evaluated during replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub gate: GateKind,
    pub verdict: String,
    pub rule_id: Option<String>,
    pub message: Option<String>,
}

impl GateVerdict {
    #[must_use]
    pub fn is_allow(&self) -> bool {
        self.verdict == "allow"
    }
}

/// Result of replaying one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub run_id: RunId,
    pub status: ReplayStatus,
    pub original_fingerprint: Digest,
    pub replay_fingerprint: Digest,
    #[serde(rename = "match")]
    pub matches: bool,
    pub divergence: Option<Divergence>,
    pub diagnosis: Option<Diagnosis>,
    pub event_count: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gates: Vec<GateVerdict>,
}

impl ReplayReport {
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.status == ReplayStatus::Verified
    }

    /// Whether every evaluated gate allowed
    #[must_use]
    pub fn gates_allowed(&self) -> bool {
        self.gates.iter().all(GateVerdict::is_allow)
    }

    /// Process exit code: 0 verified with every gate allowing, 1 otherwise
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!(self.is_verified() && self.gates_allowed()))
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Multi-line summary for terminals
    #[must_use]
    pub fn render_human(&self) -> String {
        let mut out = format!(
            "run {}: {}\n  events:      {}\n  original:    {}\n  replayed:    {}\n",
            self.run_id,
            self.status,
            self.event_count,
            self.original_fingerprint,
            self.replay_fingerprint,
        );
        if let Some(div) = &self.divergence {
            out.push_str(&format!(
                "  diverged at: {}\n    expected {}\n    got      {}\n",
                div.field, div.expected, div.got
            ));
            if let Some(index) = div.first_divergent_event_index {
                out.push_str(&format!("  first divergent event: {index}\n"));
            }
        }
        if let Some(diagnosis) = self.diagnosis {
            out.push_str(&format!("  diagnosis:   {diagnosis} ({})\n", diagnosis.hint()));
        }
        for gate in &self.gates {
            match &gate.rule_id {
                Some(rule) => out.push_str(&format!("  gate {}: {} [{rule}]\n", gate.gate, gate.verdict)),
                None => out.push_str(&format!("  gate {}: {}\n", gate.gate, gate.verdict)),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verity_core::Version;

    fn report(status: ReplayStatus) -> ReplayReport {
        let fp = Digest::sha256(b"fp");
        ReplayReport {
            run_id: RunId::derive(&Version::new(1, 0, 0), &Digest::sha256(b"in"), &Digest::sha256(b"p"))
                .unwrap(),
            status,
            original_fingerprint: fp.clone(),
            replay_fingerprint: fp,
            matches: status == ReplayStatus::Verified,
            divergence: None,
            diagnosis: None,
            event_count: 4,
            gates: Vec::new(),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(report(ReplayStatus::Verified).exit_code(), 0);
        assert_eq!(report(ReplayStatus::Diverged).exit_code(), 1);

        let mut denied = report(ReplayStatus::Verified);
        denied.gates.push(GateVerdict {
            gate: GateKind::Replay,
            verdict: "deny".into(),
            rule_id: Some("replay-001".into()),
            message: None,
        });
        assert_eq!(denied.exit_code(), 1);
    }

    #[test]
    fn test_json_uses_match_key() {
        let json = report(ReplayStatus::Verified).to_json();
        assert_eq!(json["match"], true);
        assert_eq!(json["status"], "verified");
        assert!(json["divergence"].is_null());
        assert!(json.get("gates").is_none());
    }

    #[test]
    fn test_human_output_names_divergent_field() {
        let mut r = report(ReplayStatus::Diverged);
        r.divergence = Some(Divergence {
            field: "event_log_hash".into(),
            expected: "aa".into(),
            got: "bb".into(),
            first_divergent_event_index: Some(5),
        });
        r.diagnosis = Some(Diagnosis::ArrayOrder);
        let text = r.render_human();
        assert!(text.contains("diverged at: event_log_hash"));
        assert!(text.contains("first divergent event: 5"));
        assert!(text.contains("array-order"));
    }
}
