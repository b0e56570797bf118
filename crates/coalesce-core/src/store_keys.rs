//! Typed key naming for the shared store.
//!
//! Every key the service writes lives under one namespace prefix so several
//! deployments can share a store:
//!
//! | Key | Shape | Holds |
//! |-----|-------|-------|
//! | Key Registry | `{prefix}list_keys` | set of active commonality keys |
//! | Membership List | `{prefix}lists.{key}` | ordered job ids for one key |
//! | Stats Counter | `{prefix}stats.{name}` | integer counter |
//!
//! # Example
//!
//! ```rust
//! use coalesce_core::StoreKeys;
//!
//! let keys = StoreKeys::new("coalesce.v1.");
//! assert_eq!(keys.stat("pending"), "coalesce.v1.stats.pending");
//! ```

use crate::id::CommonalityKey;

/// Default namespace prefix shared by store keys and bus routes.
pub const DEFAULT_PREFIX: &str = "coalesce.v1.";

/// Builds store key names under a fixed namespace prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKeys {
    prefix: String,
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl StoreKeys {
    /// Creates a key builder for the given prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Returns the namespace prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key of the registry set holding every active commonality key.
    #[must_use]
    pub fn registry(&self) -> String {
        format!("{}list_keys", self.prefix)
    }

    /// Key of the membership list for `key`.
    #[must_use]
    pub fn list(&self, key: &CommonalityKey) -> String {
        format!("{}lists.{}", self.prefix, key.as_str())
    }

    /// Key of the named stats counter.
    #[must_use]
    pub fn stat(&self, name: &str) -> String {
        format!("{}stats.{name}", self.prefix)
    }
}
