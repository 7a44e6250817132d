//! Execution gates.
//!
//! Each gate evaluates a view of the pinned bundle filtered by rule kind.
//! The evaluator is the same in every mode; [`PolicyMode`] only decides
//! whether a denial blocks or is logged.

use crate::bundle::{CompiledBundle, RuleKind};
use crate::condition::PolicyContext;
use crate::evaluate::{Evaluation, Verdict, evaluate_rules};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use verity_core::{Classify, ErrorKind};

/// Points in a run where policy is consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateKind {
    /// Before a run starts; every rule applies
    PreExecution,
    /// On each tool call; capability rules only
    ToolCall,
    /// After a run; replay-integrity rules only
    PostExecution,
    /// During replay; fingerprint-match rules only
    Replay,
}

impl GateKind {
    /// Whether a rule of `kind` is evaluated at this gate
    #[must_use]
    pub const fn admits(&self, kind: RuleKind) -> bool {
        match self {
            Self::PreExecution => true,
            Self::ToolCall => matches!(kind, RuleKind::Capability),
            Self::PostExecution => matches!(kind, RuleKind::ReplayIntegrity),
            Self::Replay => matches!(kind, RuleKind::FingerprintMatch),
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PreExecution => "pre-execution",
            Self::ToolCall => "tool-call",
            Self::PostExecution => "post-execution",
            Self::Replay => "replay",
        }
    }
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether denials block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    #[default]
    Enforce,
    Warn,
}

/// Policy configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub mode: PolicyMode,
    /// Bundle file; the strict bundle is used when unset
    pub bundle_path: Option<PathBuf>,
}

/// A denial that blocked execution
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("policy denied at {gate} gate by rule {rule_id}: {message}")]
pub struct PolicyDenied {
    pub gate: GateKind,
    pub rule_id: String,
    pub message: String,
    pub suggestion: String,
}

impl Classify for PolicyDenied {
    fn kind(&self) -> ErrorKind {
        ErrorKind::PolicyDenied
    }
}

/// Result of passing a gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    pub gate: GateKind,
    pub evaluation: Evaluation,
    /// A denial was found but not enforced (warn mode)
    pub waived: bool,
}

impl GateOutcome {
    /// Payload for a `policy_decision` event. Outcomes of non-deterministic
    /// rules are left out so they never reach the event log hash.
    #[must_use]
    pub fn event_payload(&self, policy_version: &verity_core::Digest) -> Value {
        let (verdict, rule_id) = match &self.evaluation.verdict {
            Verdict::Deny { rule_id, .. } if self.evaluation.deny_deterministic => {
                ("deny", Value::String(rule_id.clone()))
            }
            _ => ("allow", Value::Null),
        };
        let annotations: Vec<Value> = self
            .evaluation
            .annotations
            .iter()
            .filter(|a| a.deterministic)
            .map(|a| json!({"rule_id": a.rule_id, "severity": a.severity}))
            .collect();
        json!({
            "gate": self.gate,
            "policy_version": policy_version,
            "verdict": verdict,
            "rule_id": rule_id,
            "waived": self.waived,
            "annotations": annotations,
        })
    }
}

/// Gate runner over a pinned bundle
#[derive(Debug, Clone)]
pub struct PolicyGate {
    bundle: Arc<CompiledBundle>,
    mode: PolicyMode,
}

impl PolicyGate {
    /// Create an enforcing gate
    #[must_use]
    pub fn new(bundle: Arc<CompiledBundle>) -> Self {
        Self {
            bundle,
            mode: PolicyMode::Enforce,
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: PolicyMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn mode(&self) -> PolicyMode {
        self.mode
    }

    #[must_use]
    pub fn bundle(&self) -> &Arc<CompiledBundle> {
        &self.bundle
    }

    /// Evaluate the rules admitted by `gate` without applying the mode
    #[must_use]
    pub fn evaluate(&self, gate: GateKind, context: &PolicyContext) -> Evaluation {
        let rules = self.bundle.rules().iter().filter(|r| gate.admits(r.kind));
        evaluate_rules(&self.bundle, rules, context)
    }

    /// Run a gate
    ///
    /// # Errors
    ///
    /// Returns [`PolicyDenied`] when a DENY rule fires in enforce mode
    pub fn check(
        &self,
        gate: GateKind,
        context: &PolicyContext,
    ) -> Result<GateOutcome, PolicyDenied> {
        let evaluation = self.evaluate(gate, context);
        for annotation in &evaluation.annotations {
            tracing::debug!(
                gate = %gate,
                rule_id = %annotation.rule_id,
                severity = %annotation.severity,
                "policy annotation"
            );
        }

        let Verdict::Deny {
            rule_id,
            message,
            suggestion,
        } = &evaluation.verdict
        else {
            return Ok(GateOutcome {
                gate,
                evaluation,
                waived: false,
            });
        };

        match self.mode {
            PolicyMode::Enforce => {
                tracing::info!(gate = %gate, rule_id = %rule_id, "policy denied");
                Err(PolicyDenied {
                    gate,
                    rule_id: rule_id.clone(),
                    message: message.clone(),
                    suggestion: suggestion.clone(),
                })
            }
            PolicyMode::Warn => {
                tracing::warn!(
                    gate = %gate,
                    rule_id = %rule_id,
                    suggestion = %suggestion,
                    "policy denial not enforced in warn mode"
                );
                Ok(GateOutcome {
                    gate,
                    evaluation,
                    waived: true,
                })
            }
        }
    }
}
