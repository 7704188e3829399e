//! Typed resources watched and written by the operator
//!
//! These objects are owned by the platform; the operator never installs
//! their definitions, it only reads and updates instances.

mod cluster_operator;
mod config;
mod operator;
mod types;

pub use cluster_operator::{
    ClusterOperator, ClusterOperatorSpec, ClusterOperatorStatus, ClusterOperatorStatusCondition,
    ObjectReference, OperandVersion,
};
pub use config::{
    Image, ImageSpec, ImageStatus, Ingress, IngressSpec, Project, ProjectSpec, RegistryLocation,
};
pub use operator::{OpenShiftAPIServer, OpenShiftAPIServerSpec, OpenShiftAPIServerStatus};
pub use types::{
    find_condition, set_condition, ConditionStatus, LogLevel, ManagementState, NameReference,
    OperatorCondition,
};
