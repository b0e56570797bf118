//! Strongly-typed identifiers for coalescing entities.
//!
//! Both identifiers are opaque strings owned by external systems: commonality
//! keys come from routing annotations on the bus, job identifiers from the
//! job-status service. Wrapping them prevents passing a job where a key is
//! expected.
//!
//! # Example
//!
//! ```rust
//! use coalesce_core::id::{CommonalityKey, JobId};
//!
//! let key = CommonalityKey::new("builds.linux64").unwrap();
//! let job = JobId::new("fMvN1c3SRzOi4nJVp1jH4Q").unwrap();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: JobId = key;
//! assert_eq!(key.as_str(), "builds.linux64");
//! assert_eq!(job.to_string(), "fMvN1c3SRzOi4nJVp1jH4Q");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

fn validate(kind: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidId {
            message: format!("{kind} must not be empty"),
        });
    }
    Ok(())
}

/// The grouping dimension under which jobs are coalesced.
///
/// Keys are created implicitly on first insert and destroyed when their
/// membership list becomes empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommonalityKey(String);

impl CommonalityKey {
    /// Creates a commonality key, rejecting empty values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if the value is empty or whitespace.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        validate("commonality key", &value)?;
        Ok(Self(value))
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An opaque identifier naming one unit of work tracked by the job-status service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Creates a job identifier, rejecting empty values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if the value is empty or whitespace.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        validate("job id", &value)?;
        Ok(Self(value))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! string_id_impls {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id_impls!(CommonalityKey);
string_id_impls!(JobId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ids_are_rejected() {
        assert!(CommonalityKey::new("").is_err());
        assert!(JobId::new("   ").is_err());
    }

    #[test]
    fn parse_and_display_agree() {
        let job: JobId = "abc123".parse().unwrap();
        assert_eq!(job.to_string(), "abc123");
    }

    #[test]
    fn try_from_string_validates() {
        assert!(JobId::try_from(String::new()).is_err());
        let key = CommonalityKey::try_from("builds.win".to_string()).unwrap();
        assert_eq!(String::from(key), "builds.win");
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn non_blank_ids_round_trip(value in "[ -~]{0,8}[!-~][ -~]{0,8}") {
                let job = JobId::new(value.clone())
                    .unwrap_or_else(|e| panic!("rejected {value:?}: {e}"));
                prop_assert_eq!(job.as_str(), value.as_str());
                prop_assert_eq!(job.to_string().parse::<JobId>().ok(), Some(job.clone()));

                let json = serde_json::to_string(&job)
                    .unwrap_or_else(|e| panic!("failed to serialize job id: {e}"));
                let back: JobId = serde_json::from_str(&json)
                    .unwrap_or_else(|e| panic!("failed to deserialize job id: {e}"));
                prop_assert_eq!(back, job);

                let key = CommonalityKey::try_from(value.clone())
                    .unwrap_or_else(|e| panic!("rejected {value:?}: {e}"));
                prop_assert_eq!(String::from(key), value);
            }

            #[test]
            fn blank_ids_are_rejected(value in "[ \t\n\r]{0,8}") {
                prop_assert!(JobId::new(value.clone()).is_err());
                prop_assert!(value.parse::<CommonalityKey>().is_err());
                let json = serde_json::to_string(&value)
                    .unwrap_or_else(|e| panic!("failed to serialize string: {e}"));
                prop_assert!(serde_json::from_str::<JobId>(&json).is_err());
            }
        }
    }
}
