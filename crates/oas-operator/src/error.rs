//! Startup errors
//!
//! Everything here is fatal: a startup fault aborts the whole sequence before
//! any cache or controller has been started.

use thiserror::Error;

use crate::startup::ApiGroup;

/// Error raised while bringing the operator up
#[derive(Debug, Error)]
pub enum Error {
    /// A typed client for one API group could not be built
    #[error("failed to build {group} client: {source}")]
    ClientConstruction {
        /// The API group whose client failed
        group: ApiGroup,
        /// Underlying cause
        #[source]
        source: oas_common::Error,
    },

    /// The published status record could not be read
    #[error("failed to read clusteroperator/{name}: {source}")]
    StatusRead {
        /// Name of the record
        name: String,
        /// Underlying cause
        #[source]
        source: oas_common::Error,
    },

    /// A controller could not be constructed
    #[error("failed to construct {controller}: {source}")]
    Wiring {
        /// Controller name
        controller: &'static str,
        /// Underlying cause
        #[source]
        source: oas_common::Error,
    },

    /// The diagnostic HTTP surface failed
    #[error("debug server error: {0}")]
    DebugServer(String),

    /// Any other error from the shared layer
    #[error(transparent)]
    Common(#[from] oas_common::Error),
}

impl Error {
    /// Create a client construction error for `group`
    pub fn client(group: ApiGroup, source: impl Into<oas_common::Error>) -> Self {
        Self::ClientConstruction {
            group,
            source: source.into(),
        }
    }
}

/// Result type alias using the startup error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_names_the_group() {
        let err = Error::client(
            ApiGroup::Operator,
            oas_common::Error::Config("no server".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "failed to build operator.openshift.io client: invalid configuration: no server"
        );
    }

    #[test]
    fn status_read_error_names_the_record() {
        let err = Error::StatusRead {
            name: "openshift-apiserver".to_string(),
            source: oas_common::Error::Config("denied".to_string()),
        };
        assert!(err.to_string().starts_with("failed to read clusteroperator/openshift-apiserver"));
    }
}
