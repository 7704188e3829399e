//! Reconciliation loops of the OpenShift API server operator
//!
//! Every controller is a [`Reconciler`] driven by a [`QueueController`]:
//!
//! - **Workload**: renders and applies the openshift-apiserver Deployment,
//!   its config and its APIService registrations
//! - **Config observer**: projects cluster config into `observedConfig`
//! - **Resource sync**: mirrors ConfigMaps and Secrets between namespaces
//! - **Finalizer**: releases the target namespace once its workload is gone
//! - **Cluster status**: publishes the aggregated ClusterOperator status
//! - **Config overrides**: blocks upgrades while unsupported overrides are set
//! - **Log level**: follows the configured operator verbosity

pub mod cluster_status;
pub mod config_observer;
pub mod config_overrides;
pub mod finalizer;
pub mod log_level;
pub mod operator_client;
pub mod resource_sync;
pub mod runner;
pub mod workload;

pub use cluster_status::ClusterStatusController;
pub use config_observer::{ClusterConfigCaches, ConfigObserver};
pub use config_overrides::ConfigOverridesController;
pub use finalizer::FinalizerController;
pub use log_level::{LogLevelController, LogLevelSetter};
pub use operator_client::{KubeOperatorState, OperatorState};
pub use resource_sync::{
    default_sync_rules, ResourceLocation, ResourceSyncController, ResourceSyncer, SyncRule, SyncRules,
};
pub use runner::{Controller, QueueController, Reconciler};
pub use workload::{WorkloadController, WorkloadImages};
