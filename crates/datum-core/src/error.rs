//! Error types and result aliases for datum.
//!
//! This module defines the shared error type used by every datum crate.
//! Errors are structured for programmatic handling: each variant belongs to
//! exactly one [`ErrorKind`], which is what callers use to tell "not found"
//! (valid request, no match) from "invalid request" and from "conflict"
//! (valid request that would violate an existing invariant).

use std::fmt;

/// The result type used throughout datum.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request was valid but nothing matched it.
    NotFound,
    /// The request itself was malformed or not applicable.
    Invalid,
    /// The request was valid but would violate an existing invariant.
    Conflict,
    /// A failure in the storage layer or a bug.
    Internal,
}

/// Errors that can occur in datum operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A configuration was malformed; nothing was built from it.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },

    /// The requested resource was not found.
    #[error("not found: {resource_type} '{name}'")]
    ResourceNotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The name or identifier that was looked up.
        name: String,
    },

    /// A data ID did not provide a value for a required dimension.
    #[error("no value in data ID for required dimension '{dimension}'")]
    MissingDimension {
        /// The dimension without a value.
        dimension: String,
    },

    /// A named collection does not exist.
    #[error("collection '{name}' not found")]
    MissingCollection {
        /// The collection name.
        name: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A definition or association conflicts with one that already exists.
    #[error("conflicting definition: {message}")]
    ConflictingDefinition {
        /// Description of the conflict.
        message: String,
    },

    /// A lookup matched more than one candidate and has no single answer.
    #[error("ambiguous result: {message}")]
    AmbiguousResult {
        /// Description of the ambiguity.
        message: String,
    },

    /// Removing an entity would leave dangling references to it.
    #[error("referential integrity violation: {message}")]
    ReferentialIntegrity {
        /// Description of the violation.
        message: String,
    },

    /// The operation is not valid for the collection's type.
    #[error("collection '{collection}' has type {actual}; operation requires {expected}")]
    CollectionTypeMismatch {
        /// The collection name.
        collection: String,
        /// The collection's actual type.
        actual: String,
        /// The type (or types) the operation supports.
        expected: String,
    },

    /// A coordinate accessor was used without the capability it requires.
    #[error("data coordinate {coordinate} lacks capability '{capability}'")]
    MissingCapability {
        /// The capability that was needed (`full` or `records`).
        capability: &'static str,
        /// Display form of the coordinate.
        coordinate: String,
    },

    /// A mutating operation was attempted on a read-only registry or table.
    #[error("read-only: {message}")]
    ReadOnly {
        /// Description of the rejected operation.
        message: String,
    },

    /// A transaction could not be committed and was rolled back.
    #[error("transaction aborted: {message}")]
    TransactionAborted {
        /// Why the commit was refused.
        message: String,
    },

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

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a new resource not found error.
    #[must_use]
    pub fn resource_not_found(resource_type: &'static str, name: impl fmt::Display) -> Self {
        Self::ResourceNotFound {
            resource_type,
            name: name.to_string(),
        }
    }

    /// Creates a new missing-dimension error.
    #[must_use]
    pub fn missing_dimension(dimension: impl Into<String>) -> Self {
        Self::MissingDimension {
            dimension: dimension.into(),
        }
    }

    /// Creates a new conflicting-definition error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::ConflictingDefinition {
            message: message.into(),
        }
    }

    /// Creates a new ambiguous-result error.
    #[must_use]
    pub fn ambiguous(message: impl Into<String>) -> Self {
        Self::AmbiguousResult {
            message: message.into(),
        }
    }

    /// Creates a new read-only error.
    #[must_use]
    pub fn read_only(message: impl Into<String>) -> Self {
        Self::ReadOnly {
            message: message.into(),
        }
    }

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

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classifies this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ResourceNotFound { .. }
            | Self::MissingDimension { .. }
            | Self::MissingCollection { .. } => ErrorKind::NotFound,
            Self::Config { .. }
            | Self::InvalidInput(_)
            | Self::CollectionTypeMismatch { .. }
            | Self::MissingCapability { .. }
            | Self::ReadOnly { .. } => ErrorKind::Invalid,
            Self::ConflictingDefinition { .. }
            | Self::AmbiguousResult { .. }
            | Self::ReferentialIntegrity { .. }
            | Self::TransactionAborted { .. } => ErrorKind::Conflict,
            Self::Storage { .. } | Self::Serialization { .. } | Self::Internal { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// Returns true if this is a "not found" outcome.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound)
    }

    /// Returns true if this is a "conflict" outcome.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_separate_user_visible_outcomes() {
        assert_eq!(
            Error::resource_not_found("dataset type", "bias").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(Error::missing_dimension("detector").kind(), ErrorKind::NotFound);
        assert_eq!(
            Error::InvalidInput("bad".into()).kind(),
            ErrorKind::Invalid
        );
        assert_eq!(Error::conflict("dup").kind(), ErrorKind::Conflict);
        assert_eq!(Error::ambiguous("two rows").kind(), ErrorKind::Conflict);
        assert_eq!(Error::storage("io").kind(), ErrorKind::Internal);
    }

    #[test]
    fn display_includes_context() {
        let err = Error::CollectionTypeMismatch {
            collection: "calibs".into(),
            actual: "CALIBRATION".into(),
            expected: "TAGGED".into(),
        };
        assert_eq!(
            err.to_string(),
            "collection 'calibs' has type CALIBRATION; operation requires TAGGED"
        );
    }
}
