//! VERITY.FABRIC Policy System
//!
//! Content-addressed policy bundles, a pure first-denial-wins evaluator and
//! the four gates that invoke it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bundle;
pub mod condition;
pub mod defaults;
pub mod error;
pub mod evaluate;
pub mod gate;
pub mod schema;

pub use bundle::{CompiledBundle, PolicyBundle, Rule, RuleKind, Severity};
pub use condition::{Condition, PolicyContext};
pub use defaults::default_strict_bundle;
pub use error::PolicyError;
pub use evaluate::{Annotation, Evaluation, Verdict, evaluate};
pub use gate::{GateKind, GateOutcome, PolicyConfig, PolicyDenied, PolicyGate, PolicyMode};
