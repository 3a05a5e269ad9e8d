//! Error types and result aliases for depot.
//!
//! These are the failures raised by the shared collaborators (storage, leases,
//! scheduling, caching, configuration). The pipeline crate wraps them into its
//! own taxonomy so callers can tell contention from bad input from outages.

use std::fmt;

/// The result type used throughout depot-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by depot's shared collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// The requested record was not found.
    #[error("not found: {kind} with key {key}")]
    RecordNotFound {
        /// The entity kind that was looked up.
        kind: &'static str,
        /// The key that was looked up.
        key: String,
    },

    /// A path or object was not found (simple variant for storage).
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A precondition for the operation was not met.
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Description of the failed precondition.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new record not found error.
    #[must_use]
    pub fn record_not_found(kind: &'static str, key: impl fmt::Display) -> Self {
        Self::RecordNotFound {
            kind,
            key: key.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
