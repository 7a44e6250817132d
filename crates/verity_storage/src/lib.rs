//! VERITY.FABRIC Storage
//!
//! Everything is read and written through the [`KvStore`] interface.
//! [`RunRepository`] maps runs onto keys.

#![warn(clippy::all)]

pub mod dir;
pub mod error;
pub mod kv;
pub mod layout;
pub mod memory;

pub use dir::DirStore;
pub use error::StoreError;
pub use kv::{KvStore, StoreBackend, StoreConfig, open_store, validate_key};
pub use layout::{RunRepository, StoredRun};
pub use memory::MemoryStore;
