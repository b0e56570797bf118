//! In-memory oracle for testing.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use coalesce_core::JobId;

use super::{JobStatusOracle, OracleError};
use crate::notification::JobState;

#[derive(Debug, Default)]
struct OracleState {
    answers: HashMap<JobId, Result<JobState, OracleError>>,
    calls: HashMap<JobId, usize>,
}

/// In-memory oracle with scripted answers.
///
/// Jobs without an answer are [`OracleError::NotFound`].
#[derive(Debug, Default)]
pub struct InMemoryOracle {
    state: RwLock<OracleState>,
}

impl InMemoryOracle {
    /// Creates an oracle that knows no jobs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the state reported for `job`.
    pub fn set_state(&self, job: &JobId, state: JobState) {
        self.answer(job, Ok(state));
    }

    /// Makes lookups of `job` fail transiently.
    pub fn set_unavailable(&self, job: &JobId, message: impl Into<String>) {
        self.answer(job, Err(OracleError::Transient(message.into())));
    }

    /// Forgets `job`, so lookups return [`OracleError::NotFound`].
    pub fn forget(&self, job: &JobId) {
        if let Ok(mut state) = self.state.write() {
            state.answers.remove(job);
        }
    }

    /// Returns how many times `job` was looked up.
    #[must_use]
    pub fn calls(&self, job: &JobId) -> usize {
        self.state
            .read()
            .map(|state| state.calls.get(job).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn answer(&self, job: &JobId, answer: Result<JobState, OracleError>) {
        if let Ok(mut state) = self.state.write() {
            state.answers.insert(job.clone(), answer);
        }
    }
}

#[async_trait]
impl JobStatusOracle for InMemoryOracle {
    async fn status(&self, job: &JobId) -> Result<JobState, OracleError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| OracleError::Transient("oracle lock poisoned".into()))?;
        *state.calls.entry(job.clone()).or_default() += 1;
        state
            .answers
            .get(job)
            .cloned()
            .unwrap_or(Err(OracleError::NotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_answers() {
        let oracle = InMemoryOracle::new();
        let a = JobId::new("a").unwrap();
        let b = JobId::new("b").unwrap();

        oracle.set_state(&a, JobState::Pending);
        oracle.set_unavailable(&b, "503");

        assert_eq!(oracle.status(&a).await, Ok(JobState::Pending));
        assert!(matches!(oracle.status(&b).await, Err(OracleError::Transient(_))));

        oracle.forget(&a);
        assert_eq!(oracle.status(&a).await, Err(OracleError::NotFound));
        assert_eq!(oracle.calls(&a), 2);
    }
}
