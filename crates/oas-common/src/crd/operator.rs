//! OpenShiftAPIServer - the operator's own configuration object
//!
//! A single cluster-scoped instance named `cluster` carries the desired
//! management state, log levels, the projected cluster configuration
//! (`observedConfig`) and any unsupported overrides an administrator applied.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{LogLevel, ManagementState, OperatorCondition};

/// Desired state of the openshift-apiserver operand.
///
/// Example:
/// ```yaml
/// apiVersion: operator.openshift.io/v1
/// kind: OpenShiftAPIServer
/// metadata:
///   name: cluster
/// spec:
///   managementState: Managed
///   operatorLogLevel: Debug
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.openshift.io",
    version = "v1",
    kind = "OpenShiftAPIServer",
    plural = "openshiftapiservers",
    status = "OpenShiftAPIServerStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".spec.managementState"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OpenShiftAPIServerSpec {
    /// Whether and how the operator manages the operand
    #[serde(default)]
    pub management_state: ManagementState,

    /// Operand log verbosity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,

    /// Operator log verbosity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_log_level: Option<LogLevel>,

    /// Arbitrary configuration merged over the rendered operand config.
    /// Setting anything here blocks upgrades.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsupported_config_overrides: Option<serde_json::Value>,

    /// Operand configuration projected from cluster config objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_config: Option<serde_json::Value>,
}

/// Observed state of the operand, written by the operator's controllers
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenShiftAPIServerStatus {
    /// Conditions reported by each controller
    #[serde(default)]
    pub conditions: Vec<OperatorCondition>,

    /// Operand version currently rolled out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Number of ready operand replicas
    #[serde(default)]
    pub ready_replicas: i32,

    /// Generation of the spec last acted upon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl OpenShiftAPIServer {
    /// The spec's management state
    pub fn management_state(&self) -> ManagementState {
        self.spec.management_state
    }

    /// Current conditions, empty when no status has been written yet
    pub fn conditions(&self) -> &[OperatorCondition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// Unsupported overrides, ignoring `null` and empty objects
    pub fn unsupported_overrides(&self) -> Option<&serde_json::Value> {
        self.spec
            .unsupported_config_overrides
            .as_ref()
            .filter(|v| !is_empty_json(v))
    }
}

fn is_empty_json(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
