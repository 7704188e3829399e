//! Kubernetes Event recording for the operator's controllers.
//!
//! Every controller shares one recorder bound to the operator's own
//! Deployment, so `kubectl describe deployment/openshift-apiserver-operator`
//! shows what the operator has been doing.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break a sync.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use crate::FIELD_MANAGER;

/// Name of the operator Deployment events are attached to
const OPERATOR_DEPLOYMENT: &str = "openshift-apiserver-operator";

/// Sink for operator events.
///
/// Implementations never return errors; callers do not wait on delivery
/// beyond the call itself.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Record a Normal event
    async fn event(&self, reason: &str, message: String);

    /// Record a Warning event
    async fn warning(&self, reason: &str, message: String);
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventRecorder {
    recorder: Recorder,
    involved: ObjectReference,
}

impl KubeEventRecorder {
    /// Create a recorder reporting against the operator Deployment in
    /// `namespace`, as `instance` when the pod name is known
    pub fn new(client: Client, namespace: &str, instance: Option<&str>) -> Self {
        Self {
            recorder: Recorder::new(client, operator_reporter(instance)),
            involved: operator_deployment_reference(namespace),
        }
    }

    async fn publish(&self, type_: EventType, reason: &str, message: String) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message),
            action: "Sync".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &self.involved).await {
            warn!(reason, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn event(&self, reason: &str, message: String) {
        self.publish(EventType::Normal, reason, message).await;
    }

    async fn warning(&self, reason: &str, message: String) {
        self.publish(EventType::Warning, reason, message).await;
    }
}

/// Reporter identifying this operator process
pub fn operator_reporter(instance: Option<&str>) -> Reporter {
    Reporter {
        controller: FIELD_MANAGER.to_string(),
        instance: instance.map(str::to_string),
    }
}

/// Reference to the operator's Deployment, the involved object of every event
pub fn operator_deployment_reference(namespace: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("apps/v1".to_string()),
        kind: Some("Deployment".to_string()),
        name: Some(OPERATOR_DEPLOYMENT.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// No-op implementation for tests.
pub struct NoopEventRecorder;

#[async_trait]
impl EventRecorder for NoopEventRecorder {
    async fn event(&self, _reason: &str, _message: String) {}

    async fn warning(&self, _reason: &str, _message: String) {}
}

/// Well-known event reason strings.
pub mod reasons {
    /// The operator's status versions changed
    pub const OPERATOR_VERSION_CHANGED: &str = "OperatorVersionChanged";
    /// The ClusterOperator record was created
    pub const CLUSTER_OPERATOR_CREATED: &str = "ClusterOperatorCreated";
    /// Observed config was written to the operator spec
    pub const OBSERVED_CONFIG_CHANGED: &str = "ObservedConfigChanged";
    /// Writing observed config failed
    pub const OBSERVED_CONFIG_WRITE_ERROR: &str = "ObservedConfigWriteError";
    /// A synced ConfigMap was created or updated
    pub const CONFIGMAP_SYNCED: &str = "ConfigMapSynced";
    /// A synced Secret was created or updated
    pub const SECRET_SYNCED: &str = "SecretSynced";
    /// A synced destination was removed because its source disappeared
    pub const SYNC_TARGET_DELETED: &str = "SyncTargetDeleted";
    /// The operand Deployment was updated
    pub const DEPLOYMENT_UPDATED: &str = "DeploymentUpdated";
    /// An APIService registration was updated
    pub const API_SERVICE_UPDATED: &str = "APIServiceUpdated";
    /// The namespace finalizer was removed
    pub const NAMESPACE_FINALIZED: &str = "NamespaceFinalized";
    /// Operator log verbosity changed
    pub const OPERATOR_LOG_LEVEL_CHANGE: &str = "OperatorLogLevelChange";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_recorder_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventRecorder>();
    }

    #[test]
    fn involved_object_is_operator_deployment() {
        let reference = operator_deployment_reference("openshift-apiserver-operator");
        assert_eq!(reference.kind.as_deref(), Some("Deployment"));
        assert_eq!(reference.name.as_deref(), Some("openshift-apiserver-operator"));
    }

    #[test]
    fn reporter_uses_given_instance() {
        let reporter = operator_reporter(Some("openshift-apiserver-operator-7d9f"));
        assert_eq!(reporter.controller, FIELD_MANAGER);
        assert_eq!(
            reporter.instance.as_deref(),
            Some("openshift-apiserver-operator-7d9f")
        );
        assert!(operator_reporter(None).instance.is_none());
    }

    #[tokio::test]
    async fn noop_recorder_does_not_panic() {
        let recorder = NoopEventRecorder;
        recorder
            .event(reasons::OPERATOR_VERSION_CHANGED, "test".to_string())
            .await;
        recorder
            .warning(reasons::OBSERVED_CONFIG_WRITE_ERROR, "test".to_string())
            .await;
    }
}
