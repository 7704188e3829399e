//! Workload controller
//!
//! Drives the openshift-apiserver operand: the target namespace, the rendered
//! `config` ConfigMap, the `api` Service, the `apiserver` Deployment and one
//! APIService registration per served API group. Records the operand version
//! in the ledger once the Deployment has fully rolled out.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use oas_common::crd::{
    ConditionStatus, ManagementState, ObjectReference, OpenShiftAPIServer, OperatorCondition,
};
use oas_common::events::reasons;
use oas_common::kube_utils::{apply_namespaced, delete_namespaced, deterministic_hash};
use oas_common::{
    Error, EventRecorder, Informer, VersionLedger, FIELD_MANAGER, OPERAND_VERSION_KEY,
    TARGET_NAMESPACE,
};

use crate::operator_client::{degraded_condition, OperatorState};
use crate::runner::Reconciler;

const CONTROLLER_NAME: &str = "WorkloadController";
const DEGRADED_CONDITION: &str = "WorkloadDegraded";
const AVAILABLE_CONDITION: &str = "APIServerDeploymentAvailable";
const PROGRESSING_CONDITION: &str = "APIServerDeploymentProgressing";

/// Name of the operand Deployment
pub const DEPLOYMENT_NAME: &str = "apiserver";
/// Name of the rendered operand config ConfigMap
pub const CONFIG_MAP_NAME: &str = "config";
/// Name of the operand Service fronting every APIService
pub const SERVICE_NAME: &str = "api";
/// Annotation carrying the hash of the rendered config on the pod template
pub const CONFIG_HASH_ANNOTATION: &str = "operator.openshift.io/config-hash";

const REPLICAS: i32 = 3;
const API_VERSION: &str = "v1";

/// API groups served by the operand, each registered as `v1.<group>`
pub const API_GROUPS: &[&str] = &[
    "apps.openshift.io",
    "authorization.openshift.io",
    "build.openshift.io",
    "image.openshift.io",
    "oauth.openshift.io",
    "project.openshift.io",
    "quota.openshift.io",
    "route.openshift.io",
    "security.openshift.io",
    "template.openshift.io",
    "user.openshift.io",
];

/// Images and versions handed to the operand
#[derive(Clone, Debug, Default)]
pub struct WorkloadImages {
    /// Operand image
    pub image: String,
    /// Operator image (used by init containers)
    pub operator_image: String,
    /// Version recorded for the operand once rolled out
    pub version: String,
}

/// Status references for every APIService this controller registers
pub fn api_service_references() -> Vec<ObjectReference> {
    API_GROUPS
        .iter()
        .map(|group| {
            ObjectReference::cluster_scoped(
                "apiregistration.k8s.io",
                "apiservices",
                api_service_name(group),
            )
        })
        .collect()
}

fn api_service_name(group: &str) -> String {
    format!("{}.{}", API_VERSION, group)
}

/// Reconciles the operand workload
pub struct WorkloadController {
    client: Client,
    operator: Arc<dyn OperatorState>,
    deployments: Informer<Deployment>,
    ledger: Arc<VersionLedger>,
    events: Arc<dyn EventRecorder>,
    images: WorkloadImages,
}

impl WorkloadController {
    /// Create the controller
    pub fn new(
        client: Client,
        operator: Arc<dyn OperatorState>,
        deployments: Informer<Deployment>,
        ledger: Arc<VersionLedger>,
        events: Arc<dyn EventRecorder>,
        images: WorkloadImages,
    ) -> Self {
        Self {
            client,
            operator,
            deployments,
            ledger,
            events,
            images,
        }
    }

    async fn sync_managed(&self, operator: &OpenShiftAPIServer) -> Result<Deployment, Error> {
        self.ensure_namespace().await?;

        let rendered = render_config(operator)?;
        let config_hash = deterministic_hash(&rendered);
        apply_namespaced(&self.client, TARGET_NAMESPACE, &config_map(&rendered)).await?;
        apply_namespaced(&self.client, TARGET_NAMESPACE, &service()?).await?;

        let verbosity = operator.spec.log_level.unwrap_or_default().verbosity();
        let desired = deployment(&self.images, &config_hash, verbosity)?;
        let previous_hash = self
            .deployments
            .get_namespaced(TARGET_NAMESPACE, DEPLOYMENT_NAME)
            .and_then(|d| pod_template_hash(&d));
        let applied = apply_namespaced(&self.client, TARGET_NAMESPACE, &desired).await?;
        if previous_hash.as_deref() != Some(config_hash.as_str()) {
            self.events
                .event(
                    reasons::DEPLOYMENT_UPDATED,
                    format!("Updated Deployment.apps/{} with config {}", DEPLOYMENT_NAME, config_hash),
                )
                .await;
        }

        self.ensure_api_services().await?;
        Ok(applied)
    }

    async fn ensure_namespace(&self) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": TARGET_NAMESPACE,
                "labels": { "openshift.io/run-level": "1" },
            },
        });
        api.patch(
            TARGET_NAMESPACE,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&namespace),
        )
        .await?;
        Ok(())
    }

    async fn ensure_api_services(&self) -> Result<(), Error> {
        let api: Api<APIService> = Api::all(self.client.clone());
        for group in API_GROUPS {
            let desired = api_service(group)?;
            let name = api_service_name(group);
            api.patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&desired),
            )
            .await?;
            debug!(apiservice = %name, "Applied APIService");
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for WorkloadController {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    #[instrument(skip(self), fields(controller = CONTROLLER_NAME))]
    async fn sync(&self) -> Result<(), Error> {
        let operator = self.operator.get()?;
        match operator.management_state() {
            ManagementState::Managed => {}
            ManagementState::Removed => {
                if delete_namespaced::<Deployment>(&self.client, TARGET_NAMESPACE, DEPLOYMENT_NAME)
                    .await?
                {
                    info!("Removed operand Deployment");
                }
                return Ok(());
            }
            state => {
                debug!(?state, "Operand not managed, skipping");
                return Ok(());
            }
        }

        let result = self.sync_managed(&operator).await;
        let mut conditions = vec![degraded_condition(DEGRADED_CONDITION, result.as_ref().err())];

        if let Ok(deployment) = &result {
            let rollout = Rollout::of(deployment);
            conditions.push(rollout.available_condition());
            conditions.push(rollout.progressing_condition());

            let version = if rollout.complete() {
                self.ledger
                    .set_version(OPERAND_VERSION_KEY, self.images.version.clone());
                Some(self.images.version.clone())
            } else {
                None
            };
            self.operator
                .update_workload_status(rollout.available, version)
                .await?;
        }

        self.operator.update_conditions(conditions).await?;
        result.map(|_| ())
    }
}

/// Rendered operand config: a fixed header, the observed config, and the
/// unsupported overrides merged on top
pub fn render_config(operator: &OpenShiftAPIServer) -> Result<String, Error> {
    let mut config = json!({
        "apiVersion": "openshiftcontrolplane.config.openshift.io/v1",
        "kind": "OpenShiftAPIServerConfig",
    });
    if let Some(observed) = &operator.spec.observed_config {
        merge_json(&mut config, observed);
    }
    if let Some(overrides) = operator.unsupported_overrides() {
        merge_json(&mut config, overrides);
    }
    Ok(serde_json::to_string(&config)?)
}

/// Recursively merge `overlay` into `base`; objects merge key by key,
/// everything else is replaced
pub fn merge_json(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

fn config_map(rendered: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(CONFIG_MAP_NAME.to_string()),
            namespace: Some(TARGET_NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some([("config.yaml".to_string(), rendered.to_string())].into()),
        ..Default::default()
    }
}

fn service() -> Result<Service, Error> {
    Ok(serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": SERVICE_NAME,
            "namespace": TARGET_NAMESPACE,
            "annotations": {
                "service.alpha.openshift.io/serving-cert-secret-name": "serving-cert",
            },
        },
        "spec": {
            "selector": { "apiserver": "true" },
            "ports": [{ "name": "https", "port": 443, "targetPort": 8443 }],
        },
    }))?)
}

fn deployment(images: &WorkloadImages, config_hash: &str, verbosity: u8) -> Result<Deployment, Error> {
    Ok(serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": DEPLOYMENT_NAME,
            "namespace": TARGET_NAMESPACE,
            "labels": { "app": "openshift-apiserver", "apiserver": "true" },
        },
        "spec": {
            "replicas": REPLICAS,
            "selector": { "matchLabels": { "app": "openshift-apiserver", "apiserver": "true" } },
            "template": {
                "metadata": {
                    "labels": { "app": "openshift-apiserver", "apiserver": "true" },
                    "annotations": { CONFIG_HASH_ANNOTATION: config_hash },
                },
                "spec": {
                    "serviceAccountName": "openshift-apiserver-sa",
                    "priorityClassName": "system-node-critical",
                    "initContainers": [{
                        "name": "fix-audit-permissions",
                        "image": images.operator_image,
                        "command": ["sh", "-c", "chmod 0700 /var/log/openshift-apiserver"],
                        "volumeMounts": [{ "name": "audit-dir", "mountPath": "/var/log/openshift-apiserver" }],
                    }],
                    "containers": [{
                        "name": "openshift-apiserver",
                        "image": images.image,
                        "command": ["openshift-apiserver", "start"],
                        "args": [
                            "--config=/var/run/configmaps/config/config.yaml",
                            format!("-v={}", verbosity),
                        ],
                        "ports": [{ "containerPort": 8443 }],
                        "volumeMounts": [
                            { "name": "config", "mountPath": "/var/run/configmaps/config" },
                            { "name": "etcd-client", "mountPath": "/var/run/secrets/etcd-client" },
                            { "name": "etcd-serving-ca", "mountPath": "/var/run/configmaps/etcd-serving-ca" },
                            { "name": "serving-cert", "mountPath": "/var/run/secrets/serving-cert" },
                            { "name": "audit-dir", "mountPath": "/var/log/openshift-apiserver" },
                        ],
                        "readinessProbe": {
                            "httpGet": { "scheme": "HTTPS", "port": 8443, "path": "healthz" },
                        },
                    }],
                    "volumes": [
                        { "name": "config", "configMap": { "name": CONFIG_MAP_NAME } },
                        { "name": "etcd-client", "secret": { "secretName": "etcd-client" } },
                        { "name": "etcd-serving-ca", "configMap": { "name": "etcd-serving-ca" } },
                        { "name": "serving-cert", "secret": { "secretName": "serving-cert" } },
                        { "name": "audit-dir", "hostPath": { "path": "/var/log/openshift-apiserver" } },
                    ],
                },
            },
        },
    }))?)
}

fn api_service(group: &str) -> Result<APIService, Error> {
    Ok(serde_json::from_value(json!({
        "apiVersion": "apiregistration.k8s.io/v1",
        "kind": "APIService",
        "metadata": {
            "name": api_service_name(group),
            "annotations": { "service.alpha.openshift.io/inject-cabundle": "true" },
        },
        "spec": {
            "group": group,
            "version": API_VERSION,
            "service": { "namespace": TARGET_NAMESPACE, "name": SERVICE_NAME, "port": 443 },
            "groupPriorityMinimum": 9900,
            "versionPriority": 15,
        },
    }))?)
}

fn pod_template_hash(deployment: &Deployment) -> Option<String> {
    deployment
        .spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(CONFIG_HASH_ANNOTATION)
        .cloned()
}

/// Rollout progress of the operand Deployment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rollout {
    /// Desired replicas
    pub desired: i32,
    /// Replicas running the current template
    pub updated: i32,
    /// Available replicas
    pub available: i32,
    /// Whether the controller has observed the latest spec
    pub observed: bool,
}

impl Rollout {
    /// Extract rollout progress from a Deployment
    pub fn of(deployment: &Deployment) -> Self {
        let desired = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1);
        let status = deployment.status.clone().unwrap_or_default();
        let observed = match (deployment.metadata.generation, status.observed_generation) {
            (Some(generation), Some(observed)) => observed >= generation,
            (None, _) => true,
            (Some(_), None) => false,
        };
        Self {
            desired,
            updated: status.updated_replicas.unwrap_or(0),
            available: status.available_replicas.unwrap_or(0),
            observed,
        }
    }

    /// Every replica runs the latest template and is available
    pub fn complete(&self) -> bool {
        self.observed && self.updated >= self.desired && self.available >= self.desired
    }

    fn available_condition(&self) -> OperatorCondition {
        if self.available > 0 {
            OperatorCondition::new(AVAILABLE_CONDITION, ConditionStatus::True)
                .with_reason("AsExpected")
        } else {
            OperatorCondition::new(AVAILABLE_CONDITION, ConditionStatus::False)
                .with_reason("NoAPIServerPod")
                .with_message("no openshift-apiserver pods available")
        }
    }

    fn progressing_condition(&self) -> OperatorCondition {
        if self.complete() {
            OperatorCondition::new(PROGRESSING_CONDITION, ConditionStatus::False)
                .with_reason("AsExpected")
        } else {
            OperatorCondition::new(PROGRESSING_CONDITION, ConditionStatus::True)
                .with_reason("NewGeneration")
                .with_message(format!(
                    "{}/{} pods updated, {} available",
                    self.updated, self.desired, self.available
                ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use oas_common::crd::OpenShiftAPIServerSpec;

    fn rolled(generation: i64, observed: i64, updated: i32, available: i32) -> Deployment {
        let mut d = deployment(&WorkloadImages::default(), "abc", 2).unwrap();
        d.metadata.generation = Some(generation);
        d.status = Some(DeploymentStatus {
            observed_generation: Some(observed),
            updated_replicas: Some(updated),
            available_replicas: Some(available),
            ..Default::default()
        });
        d
    }

    #[test]
    fn api_service_references_cover_every_group() {
        let refs = api_service_references();
        assert_eq!(refs.len(), API_GROUPS.len());
        assert!(refs
            .iter()
            .any(|r| r.name == "v1.route.openshift.io" && r.resource == "apiservices"));
        assert!(refs.iter().all(|r| r.namespace.is_empty()));
    }

    #[test]
    fn merge_replaces_scalars_and_merges_objects() {
        let mut base = json!({"a": {"b": 1, "c": 2}, "d": [1]});
        merge_json(&mut base, &json!({"a": {"c": 3, "e": 4}, "d": [2]}));
        assert_eq!(base, json!({"a": {"b": 1, "c": 3, "e": 4}, "d": [2]}));
    }

    #[test]
    fn overrides_win_over_observed_config() {
        let mut operator = OpenShiftAPIServer::new("cluster", OpenShiftAPIServerSpec::default());
        operator.spec.observed_config = Some(json!({"routingConfig": {"subdomain": "apps.a"}}));
        operator.spec.unsupported_config_overrides =
            Some(json!({"routingConfig": {"subdomain": "apps.b"}}));

        let rendered: Value = serde_json::from_str(&render_config(&operator).unwrap()).unwrap();
        assert_eq!(rendered["routingConfig"]["subdomain"], "apps.b");
        assert_eq!(rendered["kind"], "OpenShiftAPIServerConfig");
    }

    #[test]
    fn deployment_carries_image_hash_and_verbosity() {
        let images = WorkloadImages {
            image: "registry/oas:1".to_string(),
            operator_image: "registry/op:1".to_string(),
            version: "4.1.0".to_string(),
        };
        let d = deployment(&images, "cafe", 6).unwrap();
        let spec = d.spec.as_ref().unwrap();
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("registry/oas:1"));
        assert!(pod.containers[0]
            .args
            .as_ref()
            .unwrap()
            .contains(&"-v=6".to_string()));
        assert_eq!(pod_template_hash(&d).as_deref(), Some("cafe"));
    }

    #[test]
    fn rollout_complete_only_when_all_replicas_current() {
        assert!(Rollout::of(&rolled(2, 2, 3, 3)).complete());
        assert!(!Rollout::of(&rolled(3, 2, 3, 3)).complete());
        assert!(!Rollout::of(&rolled(2, 2, 2, 3)).complete());
        assert!(!Rollout::of(&rolled(2, 2, 3, 1)).complete());
    }

    #[test]
    fn rollout_conditions() {
        let partial = Rollout::of(&rolled(2, 2, 1, 1));
        assert_eq!(partial.available_condition().status, ConditionStatus::True);
        assert_eq!(partial.progressing_condition().status, ConditionStatus::True);

        let none = Rollout::of(&rolled(1, 1, 0, 0));
        assert_eq!(none.available_condition().status, ConditionStatus::False);
    }

    #[test]
    fn api_service_targets_operand_service() {
        let svc = api_service("build.openshift.io").unwrap();
        assert_eq!(svc.metadata.name.as_deref(), Some("v1.build.openshift.io"));
        let spec = svc.spec.unwrap();
        assert_eq!(spec.group.as_deref(), Some("build.openshift.io"));
        assert_eq!(spec.service.unwrap().namespace.as_deref(), Some(TARGET_NAMESPACE));
    }
}
