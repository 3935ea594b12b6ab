//! Error types for the tessera operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each error variant includes contextual information like resource names
//! and the underlying cause.

use thiserror::Error;

/// Main error type for store and controller operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a resource
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid content
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error for {kind}: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized
        kind: String,
    },

    /// A write lost an optimistic-concurrency race
    #[error("conflict writing {resource}: {message}")]
    Conflict {
        /// Name of the contended resource
        resource: String,
        /// Description of the conflict
        message: String,
    },

    /// Requested resource does not exist
    #[error("{kind} {name:?} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "join", "store", "controller")
        context: String,
    },
}

impl Error {
    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: kind.into(),
        }
    }

    /// Create a conflict error for a resource
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a fix to the object and are
    /// not retried. Conflicts are retried by re-reading the object.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 409 is an optimistic-concurrency conflict; other 4xx are permanent
                match source {
                    kube::Error::Api(ae) => ae.code == 409 || !(400..500).contains(&ae.code),
                    _ => true,
                }
            }
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Conflict { .. } => true,
            Error::NotFound { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Check if this error reports a lost optimistic-concurrency race
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }
}
