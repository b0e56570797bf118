//! Error types for the coalescing domain.

/// The result type used throughout coalesce-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while routing, consuming or scrubbing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Required configuration is missing or invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// No routing annotation matched the configured namespace.
    #[error("no route under namespace '{namespace}' in {annotations:?}")]
    Routing {
        /// The namespace prefix that was searched for.
        namespace: String,
        /// The routing annotations carried by the message.
        annotations: Vec<String>,
    },

    /// The notification body does not have the required shape.
    #[error("malformed notification: {message}")]
    MalformedNotification {
        /// Description of the schema violation.
        message: String,
    },

    /// The notification reports a lifecycle state outside pending/running/exception.
    #[error("unrecognized job state '{state}' for job {job_id}")]
    UnrecognizedState {
        /// The reported state.
        state: String,
        /// The job the notification is about.
        job_id: String,
    },

    /// The bus transport failed.
    #[error("bus error: {message}")]
    Bus {
        /// Description of the transport failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An error from coalesce-core (including store unavailability).
    #[error("core error: {0}")]
    Core(#[from] coalesce_core::Error),
}

impl Error {
    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new malformed-notification error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedNotification {
            message: message.into(),
        }
    }

    /// Creates a new bus error.
    #[must_use]
    pub fn bus(message: impl Into<String>) -> Self {
        Self::Bus {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new bus error with a source.
    #[must_use]
    pub fn bus_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Bus {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns true if the shared store could not be reached.
    #[must_use]
    pub const fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::Core(inner) if inner.is_store_unavailable())
    }

    /// Stable label for metrics and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::Routing { .. } => "routing_error",
            Self::MalformedNotification { .. } => "malformed",
            Self::UnrecognizedState { .. } => "unrecognized_state",
            Self::Bus { .. } => "bus_error",
            Self::Core(inner) if inner.is_store_unavailable() => "store_error",
            Self::Core(_) => "core_error",
        }
    }
}
