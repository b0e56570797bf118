//! The coalescing index: Key Registry plus per-key Membership Lists.
//!
//! [`CoalescingIndex`] is a thin typed client over the shared store's atomic
//! primitives. It owns the key naming and the registry invariant; it never
//! caches a membership list between calls, so several listener instances and
//! a concurrently running scrubber can share one store.
//!
//! ## Invariants
//!
//! - A job appears at most once in a membership list (insert is idempotent).
//! - A key is registered iff its list is believed non-empty. The two may
//!   briefly diverge under concurrent writers; the next `remove` or `prune`
//!   touching the key restores the invariant.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use coalesce_core::{CommonalityKey, InMemoryKvStore, JobId, StoreKeys};
//! use coalesce_flow::index::CoalescingIndex;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> coalesce_flow::error::Result<()> {
//! let index = CoalescingIndex::new(Arc::new(InMemoryKvStore::new()), StoreKeys::default());
//! let key = CommonalityKey::new("builds.linux64")?;
//! let job = JobId::new("fMvN1c3SRzOi4nJVp1jH4Q")?;
//!
//! index.insert(&key, &job).await?;
//! index.insert(&key, &job).await?; // duplicate delivery is harmless
//! assert_eq!(index.list(&key).await?, vec![job.clone()]);
//!
//! index.remove(&key, &job).await?;
//! assert!(index.keys().await?.is_empty());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use coalesce_core::{CommonalityKey, JobId, KvStore, StoreKeys, Withdrawal};

use crate::error::Result;

/// Outcome of [`CoalescingIndex::remove`].
pub type Removal = Withdrawal;

/// Typed view over the Key Registry and Membership Lists in the shared store.
#[derive(Debug)]
pub struct CoalescingIndex<S: ?Sized> {
    store: Arc<S>,
    keys: StoreKeys,
}

impl<S: ?Sized> Clone for CoalescingIndex<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keys: self.keys.clone(),
        }
    }
}

impl<S: KvStore + ?Sized> CoalescingIndex<S> {
    /// Creates an index over `store` using the key naming of `keys`.
    #[must_use]
    pub fn new(store: Arc<S>, keys: StoreKeys) -> Self {
        Self { store, keys }
    }

    /// Returns the store key naming in use.
    #[must_use]
    pub fn store_keys(&self) -> &StoreKeys {
        &self.keys
    }

    /// Returns the underlying store handle.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Registers `key` and appends `job` to its list unless already present.
    ///
    /// Returns true if the job was newly appended. Calling this twice with
    /// the same pair leaves exactly one entry.
    ///
    /// # Errors
    ///
    /// Returns a store-unavailable error if the store cannot be reached;
    /// the caller must not assume the insert applied.
    pub async fn insert(&self, key: &CommonalityKey, job: &JobId) -> Result<bool> {
        let appended = self
            .store
            .enroll(
                &self.keys.registry(),
                &self.keys.list(key),
                key.as_str(),
                job.as_str(),
            )
            .await?;
        tracing::debug!(key = %key, job_id = %job, appended, "insert");
        Ok(appended)
    }

    /// Removes every occurrence of `job` from `key`'s list.
    ///
    /// Absent jobs are not an error. When the list becomes empty the key is
    /// deregistered.
    ///
    /// # Errors
    ///
    /// Returns a store-unavailable error if the store cannot be reached.
    pub async fn remove(&self, key: &CommonalityKey, job: &JobId) -> Result<Removal> {
        let removal = self
            .store
            .withdraw(
                &self.keys.registry(),
                &self.keys.list(key),
                key.as_str(),
                job.as_str(),
            )
            .await?;
        tracing::debug!(
            key = %key,
            job_id = %job,
            removed = removal.removed,
            deregistered = removal.deregistered,
            "remove"
        );
        Ok(removal)
    }

    /// Returns a snapshot of `key`'s membership list in arrival order.
    ///
    /// The list may change concurrently; repeat reads are not stable.
    ///
    /// # Errors
    ///
    /// Returns a store-unavailable error if the store cannot be reached.
    pub async fn list(&self, key: &CommonalityKey) -> Result<Vec<JobId>> {
        self.range(key, 0, -1).await
    }

    /// Returns the slice `start..=stop` of `key`'s list (negative indices
    /// count from the tail), for paged reads of long lists.
    ///
    /// # Errors
    ///
    /// Returns a store-unavailable error if the store cannot be reached.
    pub async fn range(
        &self,
        key: &CommonalityKey,
        start: isize,
        stop: isize,
    ) -> Result<Vec<JobId>> {
        let raw = self
            .store
            .list_range(&self.keys.list(key), start, stop)
            .await?;
        Ok(to_job_ids(key, raw))
    }

    /// Returns the length of `key`'s list.
    ///
    /// # Errors
    ///
    /// Returns a store-unavailable error if the store cannot be reached.
    pub async fn len(&self, key: &CommonalityKey) -> Result<usize> {
        Ok(self.store.list_len(&self.keys.list(key)).await?)
    }

    /// Returns a sorted snapshot of the Key Registry.
    ///
    /// # Errors
    ///
    /// Returns a store-unavailable error if the store cannot be reached.
    pub async fn keys(&self) -> Result<Vec<CommonalityKey>> {
        let raw = self.store.set_members(&self.keys.registry()).await?;
        let mut keys = Vec::with_capacity(raw.len());
        for member in raw {
            match CommonalityKey::new(member) {
                Ok(key) => keys.push(key),
                Err(e) => tracing::warn!(error = %e, "skipping invalid registry member"),
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Returns true if `key` is currently registered.
    ///
    /// # Errors
    ///
    /// Returns a store-unavailable error if the store cannot be reached.
    pub async fn is_registered(&self, key: &CommonalityKey) -> Result<bool> {
        Ok(self.keys().await?.contains(key))
    }

    /// Deregisters `key` if its list is empty.
    ///
    /// Returns true if the key was removed from the registry.
    ///
    /// # Errors
    ///
    /// Returns a store-unavailable error if the store cannot be reached.
    pub async fn prune(&self, key: &CommonalityKey) -> Result<bool> {
        Ok(self
            .store
            .prune(&self.keys.registry(), &self.keys.list(key), key.as_str())
            .await?)
    }
}

/// Entries that are not valid job ids are skipped with a warning.
fn to_job_ids(key: &CommonalityKey, raw: Vec<String>) -> Vec<JobId> {
    raw.into_iter()
        .filter_map(|value| match JobId::new(value) {
            Ok(job) => Some(job),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "skipping invalid list entry");
                None
            }
        })
        .collect()
}
