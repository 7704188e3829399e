//! Typed clients, one per API group
//!
//! kube-rs clients are not group-specific, but the operator keeps one handle
//! per group so a group that cannot be reached fails startup on its own and
//! so each cache factory owns an independent connection pool.

use std::fmt;

use async_trait::async_trait;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// API groups the operator talks to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ApiGroup {
    /// Core and apps workload objects
    Kubernetes,
    /// operator.openshift.io
    Operator,
    /// config.openshift.io
    Config,
    /// apiregistration.k8s.io
    ApiRegistration,
}

impl ApiGroup {
    /// Every group, in construction order
    pub const ALL: [ApiGroup; 4] = [
        ApiGroup::Kubernetes,
        ApiGroup::Operator,
        ApiGroup::Config,
        ApiGroup::ApiRegistration,
    ];
}

impl fmt::Display for ApiGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Kubernetes => "kubernetes",
            Self::Operator => "operator.openshift.io",
            Self::Config => "config.openshift.io",
            Self::ApiRegistration => "apiregistration.k8s.io",
        };
        f.write_str(name)
    }
}

/// Builds a client for one API group from the connection descriptor
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientProvider: Send + Sync {
    /// Build the client for `group`
    async fn client(&self, group: ApiGroup) -> Result<Client>;
}

/// [`ClientProvider`] backed by a `kube::Config`
pub struct KubeClientProvider {
    config: kube::Config,
}

impl KubeClientProvider {
    /// Build clients from `config`
    pub fn new(config: kube::Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ClientProvider for KubeClientProvider {
    async fn client(&self, group: ApiGroup) -> Result<Client> {
        let client = Client::try_from(self.config.clone()).map_err(|e| Error::client(group, e))?;
        if group == ApiGroup::Kubernetes {
            let version = client
                .apiserver_version()
                .await
                .map_err(|e| Error::client(group, e))?;
            info!(version = %version.git_version, "Connected to API server");
        }
        Ok(client)
    }
}

/// One client per API group. Only ever observable fully populated.
#[derive(Clone)]
pub struct ClientSet {
    /// Core and apps workload objects
    pub kubernetes: Client,
    /// Operator configuration
    pub operator: Client,
    /// Cluster configuration and the ClusterOperator record
    pub config: Client,
    /// APIService registrations
    pub api_registration: Client,
}

impl ClientSet {
    /// Build every client. The first failure aborts construction and is
    /// returned alone.
    pub async fn connect(provider: &dyn ClientProvider) -> Result<Self> {
        Ok(Self {
            kubernetes: build(provider, ApiGroup::Kubernetes).await?,
            operator: build(provider, ApiGroup::Operator).await?,
            config: build(provider, ApiGroup::Config).await?,
            api_registration: build(provider, ApiGroup::ApiRegistration).await?,
        })
    }
}

async fn build(provider: &dyn ClientProvider, group: ApiGroup) -> Result<Client> {
    debug!(%group, "Building client");
    provider.client(group).await
}
