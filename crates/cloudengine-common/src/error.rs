//! Error types for the cloudengine operator
//!
//! Errors carry the kind and name of the object involved so that a failed
//! reconcile pass can be traced back to the resource that caused it.
//! The variants follow the reconcile error taxonomy: not-found and conflict
//! are expected during convergence and are absorbed or retried by callers,
//! configuration and dependency errors fail the pass and are redelivered by
//! the controller's error policy.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for cloudengine operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that does not map to a more specific variant
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The requested object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (e.g. "Pod")
        kind: String,
        /// Namespaced name of the object
        name: String,
    },

    /// A write targeted a stale resource version, or a delete precondition failed
    #[error("conflict writing {kind} {name}: object was modified")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Namespaced name of the object
        name: String,
    },

    /// A create targeted a name that is already taken
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: String,
        /// Namespaced name of the object
        name: String,
    },

    /// Programming or configuration error (e.g. malformed reconciler input)
    #[error("configuration error [{context}]: {message}")]
    Configuration {
        /// Where the invalid configuration was detected
        context: String,
        /// Description of what is invalid
        message: String,
    },

    /// An object required by the pass (Cluster or Template) is absent
    #[error("{kind} {name} not found")]
    DependencyMissing {
        /// Kind of the missing dependency
        kind: String,
        /// Name of the missing dependency
        name: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "heartbeat")
        context: String,
    },
}

impl Error {
    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a configuration error with context
    pub fn configuration(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a dependency-missing error
    pub fn dependency_missing(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::DependencyMissing {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Map a kube error for the given object onto the structured variants.
    ///
    /// 404 becomes [`Error::NotFound`], 409 becomes [`Error::Conflict`] (or
    /// [`Error::AlreadyExists`] when the API reports that reason).
    pub fn from_kube(kind: &str, name: &str, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 404 => Self::not_found(kind, name),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::already_exists(kind, name)
            }
            kube::Error::Api(ae) if ae.code == 409 => Self::conflict(kind, name),
            _ => Self::Kube { source: err },
        }
    }

    /// True for the not-found case
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True when a write lost an optimistic-concurrency race
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Check if this error is worth redelivering
    ///
    /// Configuration and serialization errors need a code or spec fix.
    /// Everything else may succeed on a later pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::NotFound { .. } => true,
            Error::Conflict { .. } => true,
            Error::AlreadyExists { .. } => true,
            Error::Configuration { .. } => false,
            Error::DependencyMissing { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
