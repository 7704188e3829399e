//! Common types for the OpenShift API server operator: resources, errors,
//! watch caches, the version ledger and the event sink

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod informer;
pub mod kube_utils;
pub mod leader_election;
pub mod retry;
pub mod telemetry;
pub mod versions;

pub use error::Error;
pub use events::{EventRecorder, KubeEventRecorder, NoopEventRecorder};
pub use informer::{CacheFactory, Informer, InformerFactory, NamespacedInformers, Watched};
pub use versions::VersionLedger;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace the operator itself runs in
pub const OPERATOR_NAMESPACE: &str = "openshift-apiserver-operator";

/// Namespace the managed API server workload runs in
pub const TARGET_NAMESPACE: &str = "openshift-apiserver";

/// Namespace holding user-specified cluster configuration
pub const GLOBAL_USER_SPECIFIED_CONFIG_NAMESPACE: &str = "openshift-config";

/// Namespace holding machine-generated cluster configuration
pub const GLOBAL_MACHINE_SPECIFIED_CONFIG_NAMESPACE: &str = "openshift-config-managed";

/// Name of the published ClusterOperator status record
pub const CLUSTER_OPERATOR_NAME: &str = "openshift-apiserver";

/// Name of the singleton operator configuration object
pub const OPERATOR_CONFIG_NAME: &str = "cluster";

/// Ledger key for the operator's own image version
pub const OPERATOR_VERSION_KEY: &str = "operator";

/// Ledger key for the managed API server's version
pub const OPERAND_VERSION_KEY: &str = "openshift-apiserver";

/// Field manager used for every server-side apply issued by the operator
pub const FIELD_MANAGER: &str = "openshift-apiserver-operator";
