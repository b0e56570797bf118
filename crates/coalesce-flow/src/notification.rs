//! Job lifecycle notifications and job states.
//!
//! Bus message bodies are validated against the minimal shape the router
//! needs before any classification happens:
//!
//! ```json
//! { "attempt": 0, "status": { "state": "pending", "jobId": "fMvN1c3SRzOi4nJVp1jH4Q" } }
//! ```
//!
//! The Taskcluster queue's own field names (`runId`, `taskId`) are accepted
//! as aliases, and unknown fields are ignored. A body that fails this shape
//! is [`Error::MalformedNotification`], which is a different condition from a
//! well-formed body reporting a state the router does not handle.

use std::fmt;

use serde::{Deserialize, Serialize};

use coalesce_core::JobId;

use crate::error::{Error, Result};

/// A job's lifecycle state as reported by notifications or the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Not yet scheduled.
    Unscheduled,
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Resolved by an exception (cancelled, deadline, worker shutdown...).
    Exception,
    /// Any state this service does not know about.
    Unknown(String),
}

impl JobState {
    /// Parses a lowercase wire state.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "unscheduled" => Self::Unscheduled,
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "exception" => Self::Exception,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Returns the wire representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unscheduled => "unscheduled",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Exception => "exception",
            Self::Unknown(other) => other,
        }
    }

    /// Returns true for the only state that keeps a job in a membership list.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for JobState {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JobState {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// What a notification asks the index to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    /// The job is waiting: insert it.
    Pending,
    /// The job left the pending state (`running` or `exception`): remove it.
    Terminal(JobState),
    /// Any other reported state.
    Unrecognized(JobState),
}

impl Lifecycle {
    /// Classifies a reported state.
    #[must_use]
    pub fn classify(state: &JobState) -> Self {
        match state {
            JobState::Pending => Self::Pending,
            JobState::Running | JobState::Exception => Self::Terminal(state.clone()),
            other => Self::Unrecognized(other.clone()),
        }
    }
}

/// Status block of a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationStatus {
    /// The reported lifecycle state.
    pub state: JobState,
    /// The job the notification is about.
    #[serde(alias = "taskId")]
    pub job_id: JobId,
}

/// A validated job lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Attempt number; only attempt `0` participates in coalescing.
    #[serde(alias = "runId")]
    pub attempt: u32,
    /// Job status.
    pub status: NotificationStatus,
}

impl Notification {
    /// Creates a notification (mostly useful in tests and tools).
    #[must_use]
    pub fn new(attempt: u32, state: JobState, job_id: JobId) -> Self {
        Self {
            attempt,
            status: NotificationStatus { state, job_id },
        }
    }

    /// Parses and validates a raw message body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedNotification`] if the body is not JSON or
    /// lacks a required field, or if the job id is empty.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| Error::malformed(e.to_string()))
    }

    /// Serializes the notification to a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedNotification`] if serialization fails.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::malformed(e.to_string()))
    }

    /// Returns true if this is the primary attempt.
    #[must_use]
    pub const fn is_primary_attempt(&self) -> bool {
        self.attempt == 0
    }

    /// Classifies the reported state.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::classify(&self.status.state)
    }
}
