//! The policy evaluator.
//!
//! Evaluation is a pure function of a compiled bundle and a context. Rules
//! run in ascending `evaluation_order`; the first DENY rule whose condition
//! holds ends evaluation. WARN and INFO outcomes are returned as annotations
//! beside the verdict, never inside it.

use crate::bundle::{CompiledBundle, Rule, Severity};
use crate::condition::PolicyContext;
use serde::{Deserialize, Serialize};

/// Outcome of a policy evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny {
        rule_id: String,
        message: String,
        suggestion: String,
    },
}

impl Verdict {
    #[must_use]
    pub const fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Rule that denied, if any
    #[must_use]
    pub fn rule_id(&self) -> Option<&str> {
        match self {
            Self::Allow => None,
            Self::Deny { rule_id, .. } => Some(rule_id),
        }
    }
}

/// A non-blocking rule that fired
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    pub suggestion: String,
    pub deterministic: bool,
}

/// Verdict plus side annotations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub verdict: Verdict,
    pub annotations: Vec<Annotation>,
    /// Whether the denying rule, if any, is deterministic
    pub deny_deterministic: bool,
}

/// Evaluate a bundle against a context
#[must_use]
pub fn evaluate(bundle: &CompiledBundle, context: &PolicyContext) -> Verdict {
    evaluate_rules(bundle, bundle.rules().iter(), context).verdict
}

/// Evaluate a sequence of rules, already in evaluation order
pub(crate) fn evaluate_rules<'a>(
    bundle: &CompiledBundle,
    rules: impl Iterator<Item = &'a Rule>,
    context: &PolicyContext,
) -> Evaluation {
    let mut annotations = Vec::new();
    for rule in rules {
        if !rule.condition.eval(context, bundle.regexes()) {
            continue;
        }
        match rule.severity {
            Severity::Deny => {
                return Evaluation {
                    verdict: Verdict::Deny {
                        rule_id: rule.id.clone(),
                        message: rule.display_message(),
                        suggestion: rule.suggestion.clone(),
                    },
                    annotations,
                    deny_deterministic: rule.deterministic,
                };
            }
            Severity::Warn | Severity::Info => annotations.push(Annotation {
                rule_id: rule.id.clone(),
                severity: rule.severity,
                message: rule.display_message(),
                suggestion: rule.suggestion.clone(),
                deterministic: rule.deterministic,
            }),
        }
    }
    Evaluation {
        verdict: Verdict::Allow,
        annotations,
        deny_deterministic: true,
    }
}

impl CompiledBundle {
    /// Evaluate every rule, returning the verdict and annotations
    #[must_use]
    pub fn evaluate(&self, context: &PolicyContext) -> Evaluation {
        evaluate_rules(self, self.rules().iter(), context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{PolicyBundle, Rule};
    use crate::condition::Condition;
    use proptest::prelude::*;
    use serde_json::json;

    fn flag(name: &str) -> Condition {
        Condition::Eq {
            field: name.into(),
            value: json!(true),
        }
    }

    fn bundle() -> CompiledBundle {
        PolicyBundle::new("test", "1.0.0")
            .with_rule(Rule::new("late-deny", Severity::Deny, 30, flag("b")))
            .with_rule(Rule::new("early-deny", Severity::Deny, 10, flag("a")))
            .with_rule(Rule::new("note", Severity::Info, 5, Condition::Always))
            .with_rule(Rule::new("warn-b", Severity::Warn, 20, flag("b")).with_suggestion("fix b"))
            .with_rule(Rule::new("after", Severity::Warn, 40, Condition::Always))
            .compile()
            .unwrap()
    }

    fn ctx(value: serde_json::Value) -> PolicyContext {
        PolicyContext::new(value).unwrap()
    }

    #[test]
    fn test_allow_when_nothing_denies() {
        let eval = bundle().evaluate(&ctx(json!({})));
        assert_eq!(eval.verdict, Verdict::Allow);
        let ids: Vec<&str> = eval.annotations.iter().map(|a| a.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["note", "after"]);
    }

    #[test]
    fn test_first_denial_wins_by_order_not_position() {
        let verdict = evaluate(&bundle(), &ctx(json!({"a": true, "b": true})));
        assert_eq!(verdict.rule_id(), Some("early-deny"));
    }

    #[test]
    fn test_deny_stops_evaluation() {
        let eval = bundle().evaluate(&ctx(json!({"b": true})));
        assert_eq!(eval.verdict.rule_id(), Some("late-deny"));
        let ids: Vec<&str> = eval.annotations.iter().map(|a| a.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["note", "warn-b"]);
        assert_eq!(eval.annotations[1].suggestion, "fix b");
    }

    #[test]
    fn test_warn_never_blocks() {
        let b = PolicyBundle::new("w", "1.0.0")
            .with_rule(Rule::new("w", Severity::Warn, 1, Condition::Always))
            .compile()
            .unwrap();
        assert!(evaluate(&b, &ctx(json!({}))).is_allow());
    }

    #[test]
    fn test_verdict_serialization() {
        let v = Verdict::Deny {
            rule_id: "r".into(),
            message: "m".into(),
            suggestion: "s".into(),
        };
        assert_eq!(
            serde_json::to_value(&v).unwrap(),
            json!({"verdict": "deny", "rule_id": "r", "message": "m", "suggestion": "s"})
        );
    }

    proptest! {
        #[test]
        fn prop_evaluate_is_pure(a in any::<bool>(), b in any::<bool>(), n in any::<i64>()) {
            let compiled = bundle();
            let context = ctx(json!({"a": a, "b": b, "n": n}));
            let first = compiled.evaluate(&context);
            let second = compiled.evaluate(&context);
            prop_assert_eq!(first, second);
        }
    }
}
