//! Job status oracle: the authoritative source of a job's current state.
//!
//! The scrubber asks the oracle about every listed job and removes the ones
//! that are no longer pending. Two failure modes matter and are kept apart:
//!
//! - [`OracleError::NotFound`]: the oracle does not know the job. It can
//!   never become pending again, so the scrubber removes it.
//! - [`OracleError::Transient`]: the question could not be answered. The
//!   scrubber keeps the job (fail open) and asks again next pass.

pub mod memory;
pub mod queue;

use std::sync::Arc;

use async_trait::async_trait;

use coalesce_core::JobId;

use crate::notification::JobState;

/// Errors returned by a [`JobStatusOracle`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    /// The oracle has no record of the job.
    #[error("job not found")]
    NotFound,

    /// The oracle could not be reached or answered with an error.
    #[error("oracle unavailable: {0}")]
    Transient(String),
}

/// Looks up a job's current lifecycle state.
#[async_trait]
pub trait JobStatusOracle: Send + Sync {
    /// Returns the current state of `job`.
    ///
    /// # Errors
    ///
    /// See [`OracleError`].
    async fn status(&self, job: &JobId) -> Result<JobState, OracleError>;
}

#[async_trait]
impl<T: JobStatusOracle + ?Sized> JobStatusOracle for Arc<T> {
    async fn status(&self, job: &JobId) -> Result<JobState, OracleError> {
        (**self).status(job).await
    }
}
