//! The built-in strict bundle.
//!
//! Context fields it reads:
//!
//! | field | used by |
//! |---|---|
//! | `pack.signed`, `pack.deterministic` | unsigned-pack, determinism-required |
//! | `tool`, `allowed_tools` | capability-check |
//! | `requested_permissions`, `allowed_permissions` | permission-scope |
//! | `require_deterministic` | determinism-required |
//! | `replay.status` | replay-integrity |
//! | `fingerprint`, `expected_fingerprint` | fingerprint-match |
//! | `elapsed_ms` | slow-run |
//! | `engine_version` | unpinned-engine |

use crate::bundle::{CompiledBundle, PolicyBundle, Rule, RuleKind, Severity};
use crate::condition::Condition;
use crate::error::PolicyError;
use serde_json::json;

/// Name of the strict bundle
pub const STRICT_BUNDLE_NAME: &str = "verity-strict";

fn field(name: &str) -> String {
    name.to_string()
}

/// The strict bundle as authored
#[must_use]
pub fn strict_bundle() -> PolicyBundle {
    PolicyBundle::new(STRICT_BUNDLE_NAME, "1.0.0")
        .with_rule(
            Rule::new(
                "unsigned-pack",
                Severity::Deny,
                10,
                Condition::Eq {
                    field: field("pack.signed"),
                    value: json!(false),
                },
            )
            .with_message("pack is not signed")
            .with_suggestion("sign the pack before execution"),
        )
        .with_rule(
            Rule::new(
                "capability-check",
                Severity::Deny,
                20,
                Condition::NotContainedIn {
                    field: field("tool"),
                    list: field("allowed_tools"),
                },
            )
            .with_kind(RuleKind::Capability)
            .with_message("tool is not in the capability allowlist")
            .with_suggestion("declare the tool in the pack and add it to allowed_tools"),
        )
        .with_rule(
            Rule::new(
                "permission-scope",
                Severity::Deny,
                30,
                Condition::NotSubset {
                    field: field("requested_permissions"),
                    of: field("allowed_permissions"),
                },
            )
            .with_kind(RuleKind::Capability)
            .with_message("requested permissions exceed the policy scope")
            .with_suggestion("request only permissions listed in allowed_permissions"),
        )
        .with_rule(
            Rule::new(
                "determinism-required",
                Severity::Deny,
                40,
                Condition::All {
                    conditions: vec![
                        Condition::Eq {
                            field: field("require_deterministic"),
                            value: json!(true),
                        },
                        Condition::Eq {
                            field: field("pack.deterministic"),
                            value: json!(false),
                        },
                    ],
                },
            )
            .with_message("policy requires a deterministic pack")
            .with_suggestion("mark the pack deterministic and remove entropy sources"),
        )
        .with_rule(
            Rule::new(
                "replay-integrity",
                Severity::Deny,
                50,
                Condition::Eq {
                    field: field("replay.status"),
                    value: json!("diverged"),
                },
            )
            .with_kind(RuleKind::ReplayIntegrity)
            .with_message("replay diverged from the recorded run")
            .with_suggestion("run diff-run against the original to locate the divergence"),
        )
        .with_rule(
            Rule::new(
                "fingerprint-match",
                Severity::Deny,
                60,
                Condition::NeField {
                    field: field("fingerprint"),
                    other: field("expected_fingerprint"),
                },
            )
            .with_kind(RuleKind::FingerprintMatch)
            .with_message("fingerprint does not match the expected value")
            .with_suggestion("verify engine and policy versions match the original run"),
        )
        .with_rule(
            Rule::new(
                "slow-run",
                Severity::Warn,
                70,
                Condition::Gt {
                    field: field("elapsed_ms"),
                    value: 60_000,
                },
            )
            .non_deterministic()
            .with_message("run exceeded 60s")
            .with_suggestion("check for stalled tool calls"),
        )
        .with_rule(
            Rule::new(
                "unpinned-engine",
                Severity::Info,
                80,
                Condition::Missing {
                    field: field("engine_version"),
                },
            )
            .with_message("no engine version in context"),
        )
}

/// The strict bundle, compiled
///
/// # Errors
///
/// Returns error only if the built-in bundle fails validation
pub fn default_strict_bundle() -> Result<CompiledBundle, PolicyError> {
    strict_bundle().compile()
}
