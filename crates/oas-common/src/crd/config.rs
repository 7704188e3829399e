//! Cluster configuration resources (config.openshift.io/v1)
//!
//! Only the fields the config observer projects into the operand
//! configuration are modelled; everything else is ignored on read.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::NameReference;

/// Cluster-wide image registry configuration
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "Image",
    plural = "images",
    status = "ImageStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Registries users may import images from
    #[serde(default)]
    pub allowed_registries_for_import: Vec<RegistryLocation>,

    /// Hostnames the default registry is reachable at from outside
    #[serde(default)]
    pub external_registry_hostnames: Vec<String>,

    /// ConfigMap in openshift-config with extra CAs trusted during image import
    #[serde(
        default,
        rename = "additionalTrustedCA",
        skip_serializing_if = "Option::is_none"
    )]
    pub additional_trusted_ca: Option<NameReference>,
}

/// Observed image registry configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    /// Hostname of the in-cluster registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_registry_hostname: Option<String>,

    /// External hostnames reported by the registry operator
    #[serde(default)]
    pub external_registry_hostnames: Vec<String>,
}

/// A registry users may import from
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryLocation {
    /// Registry domain, optionally with port
    pub domain_name: String,
    /// Whether plain HTTP is allowed
    #[serde(default)]
    pub insecure: bool,
}

/// Cluster-wide project (namespace self-provisioning) configuration
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(group = "config.openshift.io", version = "v1", kind = "Project", plural = "projects")]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    /// Message shown when a project request is denied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_request_message: Option<String>,

    /// Template in openshift-config used for new projects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_request_template: Option<NameReference>,
}

/// Cluster-wide ingress configuration
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(group = "config.openshift.io", version = "v1", kind = "Ingress", plural = "ingresses")]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// Default wildcard domain for routes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_image_config() {
        let spec: ImageSpec = serde_json::from_value(serde_json::json!({
            "allowedRegistriesForImport": [{"domainName": "quay.io", "insecure": false}],
            "externalRegistryHostnames": ["registry.example.com"],
            "additionalTrustedCA": {"name": "registry-cas"}
        }))
        .unwrap();
        assert_eq!(spec.allowed_registries_for_import[0].domain_name, "quay.io");
        assert_eq!(spec.additional_trusted_ca.unwrap().name, "registry-cas");
    }

    #[test]
    fn parses_project_template_reference() {
        let spec: ProjectSpec = serde_json::from_value(serde_json::json!({
            "projectRequestTemplate": {"name": "project-request"}
        }))
        .unwrap();
        assert_eq!(spec.project_request_template.unwrap().name, "project-request");
        assert!(spec.project_request_message.is_none());
    }
}
