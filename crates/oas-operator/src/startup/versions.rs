//! Version seeding
//!
//! The ledger starts out as a copy of the versions already published on the
//! ClusterOperator record, so the first status write after a restart keeps
//! reporting what is actually running instead of an empty version.

use async_trait::async_trait;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use tracing::info;

use oas_common::crd::ClusterOperator;
use oas_common::{VersionLedger, OPERATOR_VERSION_KEY};

use crate::error::{Error, Result};

/// Reads the published status record
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusReader: Send + Sync {
    /// Fetch the ClusterOperator named `name`. Absence is reported as an
    /// error for which `is_not_found` holds.
    async fn get(&self, name: &str) -> std::result::Result<ClusterOperator, oas_common::Error>;
}

/// [`StatusReader`] issuing a live read against the API server
pub struct KubeStatusReader {
    client: Client,
}

impl KubeStatusReader {
    /// Read through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusReader for KubeStatusReader {
    async fn get(&self, name: &str) -> std::result::Result<ClusterOperator, oas_common::Error> {
        let api: Api<ClusterOperator> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }
}

/// Seed `ledger` from the record `name`, then record the operator's own
/// version under the `operator` key
pub async fn seed_versions(
    reader: &dyn StatusReader,
    name: &str,
    ledger: &VersionLedger,
    operator_version: &str,
) -> Result<()> {
    match reader.get(name).await {
        Ok(record) => {
            for version in record.versions() {
                ledger.set_version(version.name.clone(), version.version.clone());
            }
            info!(clusteroperator = %name, versions = record.versions().len(), "Seeded versions from published status");
        }
        Err(e) if e.is_not_found() => {
            info!(clusteroperator = %name, "No published status, starting with an empty ledger");
        }
        Err(source) => {
            return Err(Error::StatusRead {
                name: name.to_string(),
                source,
            })
        }
    }

    ledger.set_version(OPERATOR_VERSION_KEY, operator_version);
    Ok(())
}
