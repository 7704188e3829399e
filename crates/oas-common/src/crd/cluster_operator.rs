//! ClusterOperator - the published, cluster-wide status record
//!
//! Every operator owns one ClusterOperator. Only its status is written; the
//! spec is intentionally empty.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ConditionStatus;

/// Public status record for a cluster component
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "ClusterOperator",
    plural = "clusteroperators",
    status = "ClusterOperatorStatus"
)]
pub struct ClusterOperatorSpec {}

/// Aggregated conditions, versions and related objects of a component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterOperatorStatus {
    /// Aggregated conditions (Available, Progressing, Degraded, Upgradeable)
    #[serde(default)]
    pub conditions: Vec<ClusterOperatorStatusCondition>,

    /// Versions of the operator and its operands
    #[serde(default)]
    pub versions: Vec<OperandVersion>,

    /// Objects useful when debugging this component
    #[serde(default)]
    pub related_objects: Vec<ObjectReference>,
}

/// One aggregated condition on a ClusterOperator
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterOperatorStatusCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    /// Condition status
    pub status: ConditionStatus,

    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last transition time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Named version of a component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
pub struct OperandVersion {
    /// Component name
    pub name: String,
    /// Version string
    pub version: String,
}

/// Reference to an object related to a ClusterOperator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ObjectReference {
    /// API group, empty for the core group
    #[serde(default)]
    pub group: String,
    /// Resource plural
    pub resource: String,
    /// Namespace, empty for cluster-scoped objects
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectReference {
    /// Reference to a cluster-scoped object
    pub fn cluster_scoped(
        group: impl Into<String>,
        resource: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
            namespace: String::new(),
            name: name.into(),
        }
    }

    /// Reference to a namespaced object
    pub fn namespaced(
        group: impl Into<String>,
        resource: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Reference to a namespace object
    pub fn namespace(name: impl Into<String>) -> Self {
        Self::cluster_scoped("", "namespaces", name)
    }
}

impl ClusterOperator {
    /// Versions in the current status, empty if none were published
    pub fn versions(&self) -> &[OperandVersion] {
        self.status
            .as_ref()
            .map(|s| s.versions.as_slice())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_published_status() {
        let json = serde_json::json!({
            "apiVersion": "config.openshift.io/v1",
            "kind": "ClusterOperator",
            "metadata": {"name": "openshift-apiserver"},
            "spec": {},
            "status": {
                "versions": [
                    {"name": "operator", "version": "4.15.0"},
                    {"name": "openshift-apiserver", "version": "4.15.0"}
                ],
                "relatedObjects": [
                    {"group": "", "resource": "namespaces", "name": "openshift-apiserver"}
                ]
            }
        });
        let co: ClusterOperator = serde_json::from_value(json).unwrap();
        assert_eq!(co.versions().len(), 2);
        assert_eq!(co.versions()[0].name, "operator");
    }

    #[test]
    fn missing_status_has_no_versions() {
        let co = ClusterOperator::new("openshift-apiserver", ClusterOperatorSpec::default());
        assert!(co.versions().is_empty());
    }

    #[test]
    fn cluster_scoped_reference_omits_namespace() {
        let reference = ObjectReference::namespace("openshift-config");
        let json = serde_json::to_value(&reference).unwrap();
        assert!(json.get("namespace").is_none());
        assert_eq!(json["resource"], "namespaces");
    }
}
