//! Config observer
//!
//! Projects cluster-wide configuration (`Image`, `Project`, `Ingress`) into
//! `spec.observedConfig` of the operator configuration, where the workload
//! controller picks it up when rendering the operand config.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, instrument};

use oas_common::crd::{Image, Ingress, Project};
use oas_common::events::reasons;
use oas_common::{
    Error, EventRecorder, Informer, GLOBAL_USER_SPECIFIED_CONFIG_NAMESPACE, TARGET_NAMESPACE,
};

use crate::operator_client::{degraded_condition, OperatorState};
use crate::resource_sync::{ResourceLocation, ResourceSyncer};
use crate::runner::Reconciler;

const CONTROLLER_NAME: &str = "ConfigObserver";
const DEGRADED_CONDITION: &str = "ConfigObservationDegraded";

/// Name of the cluster-scoped config singletons
pub const CLUSTER_CONFIG_NAME: &str = "cluster";

/// ConfigMap in the target namespace holding CAs trusted for image import
pub const IMAGE_IMPORT_CA_NAME: &str = "image-import-ca";

/// Cluster config caches read by the observer
#[derive(Clone)]
pub struct ClusterConfigCaches {
    /// `images.config.openshift.io`
    pub images: Informer<Image>,
    /// `projects.config.openshift.io`
    pub projects: Informer<Project>,
    /// `ingresses.config.openshift.io`
    pub ingresses: Informer<Ingress>,
}

/// Result of one observation pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Observation {
    /// The projected config
    pub config: Value,
    /// ConfigMap in openshift-config with extra image-import CAs, if any
    pub trusted_ca: Option<String>,
}

/// Project the cluster config objects into operand config
pub fn observe(image: Option<&Image>, project: Option<&Project>, ingress: Option<&Ingress>) -> Observation {
    let mut config = Map::new();
    let mut trusted_ca = None;

    if let Some(image) = image {
        let mut policy = Map::new();
        if let Some(host) = image
            .status
            .as_ref()
            .and_then(|s| s.internal_registry_hostname.as_ref())
        {
            policy.insert("internalRegistryHostname".into(), json!(host));
        }

        let mut external = image.spec.external_registry_hostnames.clone();
        if let Some(status) = &image.status {
            for host in &status.external_registry_hostnames {
                if !external.contains(host) {
                    external.push(host.clone());
                }
            }
        }
        if !external.is_empty() {
            policy.insert("externalRegistryHostnames".into(), json!(external));
        }
        if !image.spec.allowed_registries_for_import.is_empty() {
            policy.insert(
                "allowedRegistriesForImport".into(),
                json!(image.spec.allowed_registries_for_import),
            );
        }
        if !policy.is_empty() {
            config.insert("imagePolicyConfig".into(), Value::Object(policy));
        }

        trusted_ca = image
            .spec
            .additional_trusted_ca
            .as_ref()
            .map(|r| r.name.clone())
            .filter(|name| !name.is_empty());
    }

    if let Some(project) = project {
        let mut project_config = Map::new();
        if let Some(message) = &project.spec.project_request_message {
            project_config.insert("projectRequestMessage".into(), json!(message));
        }
        if let Some(template) = project
            .spec
            .project_request_template
            .as_ref()
            .filter(|t| !t.name.is_empty())
        {
            project_config.insert(
                "projectRequestTemplate".into(),
                json!(format!("{}/{}", GLOBAL_USER_SPECIFIED_CONFIG_NAMESPACE, template.name)),
            );
        }
        if !project_config.is_empty() {
            config.insert("projectConfig".into(), Value::Object(project_config));
        }
    }

    if let Some(domain) = ingress.and_then(|i| i.spec.domain.as_ref()).filter(|d| !d.is_empty()) {
        config.insert("routingConfig".into(), json!({ "subdomain": domain }));
    }

    Observation {
        config: Value::Object(config),
        trusted_ca,
    }
}

/// Writes observed cluster config into the operator configuration
pub struct ConfigObserver {
    operator: Arc<dyn OperatorState>,
    syncer: Arc<dyn ResourceSyncer>,
    caches: ClusterConfigCaches,
    events: Arc<dyn EventRecorder>,
}

impl ConfigObserver {
    /// Create the observer
    pub fn new(
        operator: Arc<dyn OperatorState>,
        syncer: Arc<dyn ResourceSyncer>,
        caches: ClusterConfigCaches,
        events: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            operator,
            syncer,
            caches,
            events,
        }
    }

    async fn observe_and_write(&self) -> Result<(), Error> {
        let image = self.caches.images.get(CLUSTER_CONFIG_NAME);
        let project = self.caches.projects.get(CLUSTER_CONFIG_NAME);
        let ingress = self.caches.ingresses.get(CLUSTER_CONFIG_NAME);
        let observation = observe(image.as_deref(), project.as_deref(), ingress.as_deref());

        let source = match &observation.trusted_ca {
            Some(name) => ResourceLocation::new(GLOBAL_USER_SPECIFIED_CONFIG_NAMESPACE, name.clone()),
            None => ResourceLocation::empty(),
        };
        self.syncer.sync_config_map(
            ResourceLocation::new(TARGET_NAMESPACE, IMAGE_IMPORT_CA_NAME),
            source,
        )?;

        match self.operator.set_observed_config(observation.config).await {
            Ok(true) => {
                info!("Observed config changed");
                self.events
                    .event(
                        reasons::OBSERVED_CONFIG_CHANGED,
                        "Writing updated observed config".to_string(),
                    )
                    .await;
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                self.events
                    .warning(
                        reasons::OBSERVED_CONFIG_WRITE_ERROR,
                        format!("Failed to write observed config: {}", e),
                    )
                    .await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Reconciler for ConfigObserver {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    #[instrument(skip(self), fields(controller = CONTROLLER_NAME))]
    async fn sync(&self) -> Result<(), Error> {
        // Nothing to write into until the operator config exists
        self.operator.get()?;

        let result = self.observe_and_write().await;
        self.operator
            .update_conditions(vec![degraded_condition(DEGRADED_CONDITION, result.as_ref().err())])
            .await?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oas_common::crd::{
        ImageSpec, ImageStatus, IngressSpec, NameReference, ProjectSpec, RegistryLocation,
    };

    fn image() -> Image {
        let mut image = Image::new(
            "cluster",
            ImageSpec {
                allowed_registries_for_import: vec![RegistryLocation {
                    domain_name: "quay.io".to_string(),
                    insecure: false,
                }],
                external_registry_hostnames: vec!["registry.example.com".to_string()],
                additional_trusted_ca: Some(NameReference {
                    name: "registry-cas".to_string(),
                }),
            },
        );
        image.status = Some(ImageStatus {
            internal_registry_hostname: Some("image-registry.svc:5000".to_string()),
            external_registry_hostnames: vec![
                "registry.example.com".to_string(),
                "default-route.apps.example.com".to_string(),
            ],
        });
        image
    }

    #[test]
    fn nothing_observed_without_cluster_config() {
        let observation = observe(None, None, None);
        assert_eq!(observation.config, json!({}));
        assert!(observation.trusted_ca.is_none());
    }

    #[test]
    fn image_config_is_projected() {
        let observation = observe(Some(&image()), None, None);
        let policy = &observation.config["imagePolicyConfig"];
        assert_eq!(policy["internalRegistryHostname"], "image-registry.svc:5000");
        assert_eq!(
            policy["externalRegistryHostnames"],
            json!(["registry.example.com", "default-route.apps.example.com"])
        );
        assert_eq!(policy["allowedRegistriesForImport"][0]["domainName"], "quay.io");
        assert_eq!(observation.trusted_ca.as_deref(), Some("registry-cas"));
    }

    #[test]
    fn project_and_ingress_are_projected() {
        let project = Project::new(
            "cluster",
            ProjectSpec {
                project_request_message: Some("ask an admin".to_string()),
                project_request_template: Some(NameReference {
                    name: "project-request".to_string(),
                }),
            },
        );
        let ingress = Ingress::new(
            "cluster",
            IngressSpec {
                domain: Some("apps.example.com".to_string()),
            },
        );

        let observation = observe(None, Some(&project), Some(&ingress));
        assert_eq!(
            observation.config["projectConfig"]["projectRequestTemplate"],
            "openshift-config/project-request"
        );
        assert_eq!(observation.config["projectConfig"]["projectRequestMessage"], "ask an admin");
        assert_eq!(observation.config["routingConfig"]["subdomain"], "apps.example.com");
    }

    #[test]
    fn empty_ingress_domain_is_ignored() {
        let ingress = Ingress::new("cluster", IngressSpec { domain: Some(String::new()) });
        let observation = observe(None, None, Some(&ingress));
        assert!(observation.config.get("routingConfig").is_none());
    }
}
