//! VERITY.FABRIC Core Types
//!
//! This crate contains pure types and logic with no I/O.
//! Everything that ends up inside a digest passes through [`canonical`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod canonical;
pub mod error;
pub mod hash;
pub mod id;
pub mod time;
pub mod version;

// Re-exports
pub use canonical::{CanonicalEncode, CanonicalError, Canonicalizer, canonical_bytes, canonical_hash};
pub use error::{Classify, CoreError, CoreResult, ErrorKind};
pub use hash::{Digest, DigestAlgorithm, HashError};
pub use id::{IdError, NodeId, RunId};
pub use time::{Clock, LogicalTime, ManualClock, SystemClock};
pub use version::{Version, VersionError};
