//! Controller wiring
//!
//! Builds the seven controllers, each handed only the clients, caches and
//! shared objects it needs. Informers are registered here, before any
//! factory is started, so the first list of every watched type happens once
//! the orchestrator starts the caches.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret};
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use tracing::info;

use oas_common::crd::{ClusterOperator, Image, Ingress, ObjectReference, OpenShiftAPIServer, Project};
use oas_common::{
    EventRecorder, VersionLedger, Watched, CLUSTER_OPERATOR_NAME,
    GLOBAL_MACHINE_SPECIFIED_CONFIG_NAMESPACE, GLOBAL_USER_SPECIFIED_CONFIG_NAMESPACE,
    OPERATOR_CONFIG_NAME, TARGET_NAMESPACE,
};
use oas_controllers::workload::api_service_references;
use oas_controllers::{
    ClusterConfigCaches, ClusterStatusController, ConfigObserver, ConfigOverridesController,
    Controller, FinalizerController, KubeOperatorState, LogLevelController, LogLevelSetter,
    OperatorState, QueueController, ResourceSyncController, ResourceSyncer, WorkloadController,
};

use super::clients::ClientSet;
use super::informers::Caches;
use crate::environment::OperatorEnvironment;
use crate::error::{Error, Result};

/// Periodic resync for controllers whose inputs can drift without a watch
/// event (e.g. writes racing with the cache)
const RESYNC_PERIOD: Duration = Duration::from_secs(60);

/// Shared objects handed to the controllers
pub struct WiringContext {
    /// Version ledger written by the workload controller and published by the
    /// cluster-status controller
    pub ledger: Arc<VersionLedger>,
    /// Event sink
    pub events: Arc<dyn EventRecorder>,
    /// Process log filter
    pub log_level: Arc<dyn LogLevelSetter>,
    /// Process environment
    pub environment: OperatorEnvironment,
}

/// Constructed, not yet running controllers
pub struct Wired {
    /// The seven controllers
    pub controllers: Vec<Arc<dyn Controller>>,
    /// Resource-sync controller, kept for its diagnostic handler
    pub resource_sync: Arc<ResourceSyncController>,
}

/// Objects the cluster-status controller lists regardless of state
pub fn fixed_related_objects() -> Vec<ObjectReference> {
    vec![
        ObjectReference::cluster_scoped(
            "operator.openshift.io",
            "openshiftapiservers",
            OPERATOR_CONFIG_NAME,
        ),
        ObjectReference::namespace(GLOBAL_USER_SPECIFIED_CONFIG_NAMESPACE),
        ObjectReference::namespace(GLOBAL_MACHINE_SPECIFIED_CONFIG_NAMESPACE),
        ObjectReference::namespace(oas_common::OPERATOR_NAMESPACE),
        ObjectReference::namespace(TARGET_NAMESPACE),
    ]
}

/// Fixed related objects followed by the workload's APIService registrations
pub fn related_objects() -> Vec<ObjectReference> {
    let mut objects = fixed_related_objects();
    objects.extend(api_service_references());
    objects
}

fn shared<C: Controller + 'static>(controller: C) -> Arc<dyn Controller> {
    Arc::new(controller)
}

/// Construct every controller
pub fn wire_controllers(clients: &ClientSet, caches: &Caches, ctx: &WiringContext) -> Result<Wired> {
    let operator_config = caches.operator.cluster_informer::<OpenShiftAPIServer>();
    let operator: Arc<dyn OperatorState> = Arc::new(KubeOperatorState::new(
        clients.operator.clone(),
        operator_config.clone(),
    ));

    let all_namespaces = caches.in_namespace("")?;
    let target = caches.in_namespace(TARGET_NAMESPACE)?;
    let user_config = caches.in_namespace(GLOBAL_USER_SPECIFIED_CONFIG_NAMESPACE)?;
    let managed_config = caches.in_namespace(GLOBAL_MACHINE_SPECIFIED_CONFIG_NAMESPACE)?;

    let namespaces = all_namespaces.cluster_informer::<Namespace>();
    let deployments = target.informer::<Deployment>();
    let pods = target.informer::<Pod>();
    let target_config_maps = target.informer::<ConfigMap>();
    let target_secrets = target.informer::<Secret>();
    let user_config_maps = user_config.informer::<ConfigMap>();
    let user_secrets = user_config.informer::<Secret>();
    let managed_config_maps = managed_config.informer::<ConfigMap>();
    let api_services = caches.api_registration.cluster_informer::<APIService>();
    let cluster_config = ClusterConfigCaches {
        images: caches.config.cluster_informer::<Image>(),
        projects: caches.config.cluster_informer::<Project>(),
        ingresses: caches.config.cluster_informer::<Ingress>(),
    };
    let cluster_operators = caches.config.cluster_informer::<ClusterOperator>();

    let workload = QueueController::new(WorkloadController::new(
        clients.kubernetes.clone(),
        operator.clone(),
        deployments.clone(),
        ctx.ledger.clone(),
        ctx.events.clone(),
        ctx.environment.workload_images(),
    ))
    .watching(operator_config.clone())
    .watching(deployments.clone())
    .watching(target_config_maps.clone())
    .watching(user_config_maps.clone())
    .watching(managed_config_maps)
    .watching(api_services)
    .watching(cluster_config.images.clone())
    .resync_every(RESYNC_PERIOD);

    let resource_sync = Arc::new(
        ResourceSyncController::new(
            clients.kubernetes.clone(),
            operator.clone(),
            caches.kubernetes.clone(),
            ctx.events.clone(),
        )
        .map_err(|source| Error::Wiring {
            controller: "ResourceSyncController",
            source,
        })?,
    );
    let rule_changes: Arc<dyn Watched> = resource_sync.clone();
    let resource_sync_controller = QueueController::from_arc(resource_sync.clone())
        .watching_shared(rule_changes)
        .watching(operator_config.clone())
        .watching(target_config_maps)
        .watching(target_secrets)
        .watching(user_config_maps)
        .watching(user_secrets)
        .resync_every(RESYNC_PERIOD);

    let syncer: Arc<dyn ResourceSyncer> = resource_sync.clone();
    let config_observer = QueueController::new(ConfigObserver::new(
        operator.clone(),
        syncer,
        cluster_config.clone(),
        ctx.events.clone(),
    ))
    .watching(operator_config.clone())
    .watching(cluster_config.images)
    .watching(cluster_config.projects)
    .watching(cluster_config.ingresses);

    let finalizer = QueueController::new(FinalizerController::new(
        clients.kubernetes.clone(),
        namespaces.clone(),
        pods.clone(),
        deployments.clone(),
        ctx.events.clone(),
    ))
    .watching(namespaces)
    .watching(pods)
    .watching(deployments);

    let ledger_changes: Arc<dyn Watched> = ctx.ledger.clone();
    let cluster_status = QueueController::new(ClusterStatusController::new(
        CLUSTER_OPERATOR_NAME,
        clients.config.clone(),
        operator.clone(),
        cluster_operators.clone(),
        ctx.ledger.clone(),
        related_objects(),
        ctx.events.clone(),
    ))
    .watching(operator_config.clone())
    .watching(cluster_operators)
    .watching_shared(ledger_changes)
    .resync_every(RESYNC_PERIOD);

    let config_overrides = QueueController::new(ConfigOverridesController::new(operator.clone()))
        .watching(operator_config.clone());

    let log_level = QueueController::new(LogLevelController::new(
        operator,
        ctx.log_level.clone(),
        ctx.events.clone(),
    ))
    .watching(operator_config);

    let controllers = vec![
        shared(workload),
        shared(config_observer),
        shared(resource_sync_controller),
        shared(finalizer),
        shared(cluster_status),
        shared(config_overrides),
        shared(log_level),
    ];
    info!(controllers = controllers.len(), "Controllers constructed");

    Ok(Wired {
        controllers,
        resource_sync,
    })
}
