//! Error types for pipeline operations.
//!
//! Every failure maps onto one of three caller actions through
//! [`PipelineError::kind`]: try again later, fix the input, or escalate.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Input that cannot be applied as given.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The supplied package document could not be parsed.
    #[error("malformed package document: {message}")]
    Malformed {
        /// Parser diagnostic.
        message: String,
    },

    /// The package is live and the update touched gated fields.
    #[error("update rejected for {filename}: {} cannot change while the package is live", fields.join(", "))]
    UpdateRejected {
        /// Package filename.
        filename: String,
        /// Gated fields whose values differed.
        fields: Vec<String>,
    },

    /// The resulting catalog set is not allowed for this package.
    #[error("ineligible catalogs for {filename}: {reason}")]
    IneligibleCatalogs {
        /// Package filename.
        filename: String,
        /// Why the catalogs were refused.
        reason: String,
    },

    /// A field value is outside the configured vocabulary.
    #[error("invalid {field}: {message}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Description of the problem.
        message: String,
    },

    /// Creation was requested for a filename that already exists.
    #[error("package already exists: {filename}")]
    AlreadyExists {
        /// Package filename.
        filename: String,
    },

    /// The package to update does not exist.
    #[error("package not found: {filename}")]
    NotFound {
        /// Package filename.
        filename: String,
    },
}

/// Errors raised by builders and the mutation coordinator.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A named lease could not be acquired in time.
    #[error("lock contention on {lock}")]
    LockContention {
        /// Lease name.
        lock: String,
    },

    /// The request was rejected before anything was written.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A store, lock, scheduler or cache call failed.
    #[error("store error: {0}")]
    Store(#[from] depot_core::Error),

    /// A member document could not be serialized during a rebuild.
    #[error("failed to serialize {filename}: {message}")]
    Serialization {
        /// Package filename.
        filename: String,
        /// Description of the failure.
        message: String,
    },
}

/// Coarse error classification for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Try again later.
    Retryable,
    /// Fix the input.
    InvalidInput,
    /// System failure.
    System,
}

impl PipelineError {
    /// Classifies this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::LockContention { .. } => ErrorKind::Retryable,
            Self::Validation(_) | Self::Store(depot_core::Error::InvalidInput(_)) => {
                ErrorKind::InvalidInput
            }
            Self::Store(_) | Self::Serialization { .. } => ErrorKind::System,
        }
    }

    /// Returns true if retrying later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    pub(crate) fn contention(lock: impl Into<String>) -> Self {
        Self::LockContention { lock: lock.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_separate_retry_input_and_system() {
        assert_eq!(
            PipelineError::contention("pkgsinfo_foo.dmg").kind(),
            ErrorKind::Retryable
        );
        assert_eq!(
            PipelineError::from(ValidationError::NotFound {
                filename: "foo.dmg".into()
            })
            .kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            PipelineError::from(depot_core::Error::storage("down")).kind(),
            ErrorKind::System
        );
        assert_eq!(
            PipelineError::from(depot_core::Error::InvalidInput("bad".into())).kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn update_rejected_lists_fields() {
        let err = ValidationError::UpdateRejected {
            filename: "foo.dmg".into(),
            fields: vec!["name".into(), "description".into()],
        };
        assert_eq!(
            err.to_string(),
            "update rejected for foo.dmg: name, description cannot change while the package is live"
        );
    }
}
