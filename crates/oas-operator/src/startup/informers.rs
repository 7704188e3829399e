//! Watch-cache factories, one per API group
//!
//! Factories are created here but not started; controllers register the
//! types they need during wiring and the orchestrator starts every factory
//! afterwards.

use std::sync::Arc;

use oas_common::{
    CacheFactory, InformerFactory, NamespacedInformers, GLOBAL_MACHINE_SPECIFIED_CONFIG_NAMESPACE,
    GLOBAL_USER_SPECIFIED_CONFIG_NAMESPACE, TARGET_NAMESPACE,
};

use super::clients::ClientSet;
use crate::error::Result;

/// Cache factories for every API group the operator reads
pub struct Caches {
    /// Core and apps objects, one factory per relevant namespace
    pub kubernetes: Arc<NamespacedInformers>,
    /// Operator configuration
    pub operator: Arc<InformerFactory>,
    /// Cluster configuration and the ClusterOperator record
    pub config: Arc<InformerFactory>,
    /// APIService registrations
    pub api_registration: Arc<InformerFactory>,
}

impl Caches {
    /// Create unstarted factories for `clients`. `operator_namespace` is the
    /// namespace the operator itself runs in.
    pub fn new(clients: &ClientSet, operator_namespace: &str) -> Self {
        let namespaces = [
            "",
            GLOBAL_USER_SPECIFIED_CONFIG_NAMESPACE,
            GLOBAL_MACHINE_SPECIFIED_CONFIG_NAMESPACE,
            operator_namespace,
            TARGET_NAMESPACE,
        ];
        Self {
            kubernetes: Arc::new(NamespacedInformers::new(
                clients.kubernetes.clone(),
                &namespaces,
            )),
            operator: Arc::new(InformerFactory::new("operator", clients.operator.clone())),
            config: Arc::new(InformerFactory::new("config", clients.config.clone())),
            api_registration: Arc::new(InformerFactory::new(
                "apiregistration",
                clients.api_registration.clone(),
            )),
        }
    }

    /// Every factory, for the orchestrator to start
    pub fn factories(&self) -> Vec<Arc<dyn CacheFactory>> {
        let kubernetes: Arc<dyn CacheFactory> = self.kubernetes.clone();
        let operator: Arc<dyn CacheFactory> = self.operator.clone();
        let config: Arc<dyn CacheFactory> = self.config.clone();
        let api_registration: Arc<dyn CacheFactory> = self.api_registration.clone();
        vec![kubernetes, operator, config, api_registration]
    }

    /// Factory for one namespace of core objects
    pub fn in_namespace(&self, namespace: &str) -> Result<Arc<InformerFactory>> {
        self.kubernetes
            .for_namespace(namespace)
            .cloned()
            .ok_or_else(|| {
                oas_common::Error::Config(format!("namespace {} is not watched", namespace)).into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Client;

    fn offline_clients() -> ClientSet {
        let client = Client::try_from(kube::Config::new("http://127.0.0.1:9".parse().unwrap()))
            .unwrap();
        ClientSet {
            kubernetes: client.clone(),
            operator: client.clone(),
            config: client.clone(),
            api_registration: client,
        }
    }

    #[tokio::test]
    async fn one_factory_per_group_none_started() {
        let caches = Caches::new(&offline_clients(), "openshift-apiserver-operator");
        assert_eq!(caches.factories().len(), 4);
        assert!(!caches.operator.is_started());
        assert!(!caches.config.is_started());

        let namespaces: Vec<&str> = caches.kubernetes.namespaces().collect();
        assert_eq!(namespaces.len(), 5);
        assert!(namespaces.contains(&TARGET_NAMESPACE));
    }

    #[tokio::test]
    async fn unknown_namespace_is_an_error() {
        let caches = Caches::new(&offline_clients(), "openshift-apiserver-operator");
        assert!(caches.in_namespace(TARGET_NAMESPACE).is_ok());
        assert!(caches.in_namespace("kube-system").is_err());
    }
}
