//! Namespace finalizer controller
//!
//! The namespace controller cannot finish deleting the target namespace while
//! the aggregated API it hosts is unreachable. Once the namespace is
//! terminating and its workload is gone, this controller removes the
//! `kubernetes` finalizer itself.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::{debug, info, instrument};

use oas_common::events::reasons;
use oas_common::kube_utils::is_not_found;
use oas_common::{Error, EventRecorder, Informer, TARGET_NAMESPACE};

use crate::runner::Reconciler;

const CONTROLLER_NAME: &str = "FinalizerController";
const KUBERNETES_FINALIZER: &str = "kubernetes";

/// Whether the namespace is terminating and nothing is left running in it
pub fn ready_to_finalize(namespace: &Namespace, pods: usize, deployments: usize) -> bool {
    namespace.metadata.deletion_timestamp.is_some()
        && has_kubernetes_finalizer(namespace)
        && pods == 0
        && deployments == 0
}

fn has_kubernetes_finalizer(namespace: &Namespace) -> bool {
    namespace
        .spec
        .as_ref()
        .and_then(|s| s.finalizers.as_ref())
        .is_some_and(|f| f.iter().any(|x| x == KUBERNETES_FINALIZER))
}

/// Copy of `namespace` with the `kubernetes` finalizer removed
pub fn without_kubernetes_finalizer(namespace: &Namespace) -> Namespace {
    let mut updated = namespace.clone();
    if let Some(finalizers) = updated.spec.as_mut().and_then(|s| s.finalizers.as_mut()) {
        finalizers.retain(|f| f != KUBERNETES_FINALIZER);
    }
    updated
}

/// Removes the `kubernetes` finalizer from the terminating target namespace
pub struct FinalizerController {
    client: Client,
    namespaces: Informer<Namespace>,
    pods: Informer<Pod>,
    deployments: Informer<Deployment>,
    events: Arc<dyn EventRecorder>,
}

impl FinalizerController {
    /// Create the controller
    pub fn new(
        client: Client,
        namespaces: Informer<Namespace>,
        pods: Informer<Pod>,
        deployments: Informer<Deployment>,
        events: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            client,
            namespaces,
            pods,
            deployments,
            events,
        }
    }
}

#[async_trait]
impl Reconciler for FinalizerController {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    #[instrument(skip(self), fields(controller = CONTROLLER_NAME))]
    async fn sync(&self) -> Result<(), Error> {
        let Some(namespace) = self.namespaces.get(TARGET_NAMESPACE) else {
            return Ok(());
        };

        let pods = self.pods.list_namespaced(TARGET_NAMESPACE).len();
        let deployments = self.deployments.list_namespaced(TARGET_NAMESPACE).len();
        if !ready_to_finalize(&namespace, pods, deployments) {
            debug!(pods, deployments, "Namespace not ready to finalize");
            return Ok(());
        }

        let updated = without_kubernetes_finalizer(&namespace);
        let api: Api<Namespace> = Api::all(self.client.clone());
        let body = serde_json::to_vec(&updated)?;
        match api
            .replace_subresource("finalize", TARGET_NAMESPACE, &PostParams::default(), body)
            .await
        {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        info!(namespace = TARGET_NAMESPACE, "Removed kubernetes finalizer");
        self.events
            .event(
                reasons::NAMESPACE_FINALIZED,
                format!("Finalized namespace {}", TARGET_NAMESPACE),
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NamespaceSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn namespace(terminating: bool, finalizers: &[&str]) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(TARGET_NAMESPACE.to_string()),
                deletion_timestamp: terminating.then(|| Time(chrono::Utc::now())),
                ..Default::default()
            },
            spec: Some(NamespaceSpec {
                finalizers: Some(finalizers.iter().map(|f| f.to_string()).collect()),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn active_namespace_is_left_alone() {
        assert!(!ready_to_finalize(&namespace(false, &["kubernetes"]), 0, 0));
    }

    #[test]
    fn terminating_namespace_with_workload_waits() {
        let ns = namespace(true, &["kubernetes"]);
        assert!(!ready_to_finalize(&ns, 2, 0));
        assert!(!ready_to_finalize(&ns, 0, 1));
    }

    #[test]
    fn terminating_empty_namespace_is_finalized() {
        let ns = namespace(true, &["kubernetes"]);
        assert!(ready_to_finalize(&ns, 0, 0));

        let updated = without_kubernetes_finalizer(&ns);
        assert!(updated.spec.unwrap().finalizers.unwrap().is_empty());
    }

    #[test]
    fn already_finalized_namespace_is_skipped() {
        assert!(!ready_to_finalize(&namespace(true, &[]), 0, 0));
    }

    #[test]
    fn other_finalizers_are_kept() {
        let ns = namespace(true, &["kubernetes", "example.com/cleanup"]);
        let updated = without_kubernetes_finalizer(&ns);
        assert_eq!(
            updated.spec.unwrap().finalizers.unwrap(),
            vec!["example.com/cleanup".to_string()]
        );
    }
}
