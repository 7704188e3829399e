//! Error types shared by the operator's controllers
//!
//! Errors carry enough context (object kind, name, controller) to be useful
//! when they surface in logs or in a Degraded condition message.

use thiserror::Error;

/// Main error type for operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A watched object required for a sync is not present in the cache
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Object name (namespace-qualified when namespaced)
        name: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Invalid operator or cluster configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A controller's sync failed for a reason other than the API
    #[error("sync error [{controller}]: {message}")]
    Sync {
        /// Name of the controller reporting the failure
        controller: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a not-found error for the given kind and name
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a sync error attributed to a controller
    pub fn sync(controller: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sync {
            controller: controller.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error for a known resource kind
    pub fn serialization(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
            kind: Some(kind.into()),
        }
    }

    /// Whether the error means the object does not exist, either absent from
    /// a cache or rejected by the API with HTTP 404
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube { source } => crate::kube_utils::is_not_found(source),
            _ => false,
        }
    }

    /// Whether the error is an API conflict (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube { source } if crate::kube_utils::is_conflict(source))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
            kind: None,
        }
    }
}
