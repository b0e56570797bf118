//! # coalesce-core
//!
//! Core abstractions for the job coalescing service.
//!
//! This crate provides the foundational types and traits used by the listener,
//! the scrubber and the read API:
//!
//! - **Identifiers**: Strongly-typed commonality keys and job identifiers
//! - **Store Keys**: The key naming convention of the shared store
//! - **Key-Value Store**: The atomic set/list/counter primitives the
//!   coalescing index is built on, with in-memory and Redis backends
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use coalesce_core::prelude::*;
//!
//! let keys = StoreKeys::new("coalesce.v1.");
//! let key = CommonalityKey::new("builds.linux64").unwrap();
//!
//! assert_eq!(keys.registry(), "coalesce.v1.list_keys");
//! assert_eq!(keys.list(&key), "coalesce.v1.lists.builds.linux64");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod kv;
pub mod observability;
pub mod store_keys;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use coalesce_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{CommonalityKey, JobId};
    pub use crate::kv::memory::InMemoryKvStore;
    pub use crate::kv::{KvStore, Withdrawal};
    pub use crate::store_keys::StoreKeys;
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::{CommonalityKey, JobId};
pub use kv::memory::InMemoryKvStore;
#[cfg(feature = "redis")]
pub use kv::redis::RedisKvStore;
pub use kv::{KvStore, Withdrawal};
pub use observability::{LogFormat, Redacted, init_logging};
pub use store_keys::StoreKeys;
