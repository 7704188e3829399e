//! Access to the operator's own configuration object
//!
//! Reads come from the watch cache. Writes read the live object first and
//! carry its resourceVersion, so a concurrent writer makes the API server
//! reject the update with 409 Conflict; conflicts are retried from a fresh
//! read.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tracing::debug;

use oas_common::crd::{
    set_condition, ConditionStatus, OpenShiftAPIServer, OperatorCondition,
};
use oas_common::retry::{retry_with_backoff, RetryConfig};
use oas_common::{Error, Informer, OPERATOR_CONFIG_NAME};

/// Attempts for a write that keeps losing optimistic-concurrency races
const WRITE_ATTEMPTS: u32 = 5;

/// Operator configuration reads and status writes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OperatorState: Send + Sync {
    /// The cached operator configuration
    fn get(&self) -> Result<Arc<OpenShiftAPIServer>, Error>;

    /// Merge `conditions` into the status. Returns whether anything changed.
    async fn update_conditions(&self, conditions: Vec<OperatorCondition>) -> Result<bool, Error>;

    /// Record operand readiness and (once rolled out) its version
    async fn update_workload_status(
        &self,
        ready_replicas: i32,
        version: Option<String>,
    ) -> Result<(), Error>;

    /// Replace `spec.observedConfig`. Returns whether anything changed.
    async fn set_observed_config(&self, config: serde_json::Value) -> Result<bool, Error>;
}

/// Condition reporting the outcome of a sync under `type_`, degraded when
/// `error` is set
///
/// `type_` is expected to end in `Degraded`.
pub fn degraded_condition(type_: &str, error: Option<&Error>) -> OperatorCondition {
    match error {
        None => OperatorCondition::new(type_, ConditionStatus::False).with_reason("AsExpected"),
        Some(e) => OperatorCondition::new(type_, ConditionStatus::True)
            .with_reason("SyncError")
            .with_message(e.to_string()),
    }
}

/// [`OperatorState`] backed by the API server and an operator-config cache
pub struct KubeOperatorState {
    client: Client,
    cache: Informer<OpenShiftAPIServer>,
}

impl KubeOperatorState {
    /// Create an accessor reading through `cache`
    pub fn new(client: Client, cache: Informer<OpenShiftAPIServer>) -> Self {
        Self { client, cache }
    }

    fn api(&self) -> Api<OpenShiftAPIServer> {
        Api::all(self.client.clone())
    }

    async fn patch_status(
        &self,
        resource_version: Option<String>,
        status: serde_json::Value,
    ) -> Result<(), Error> {
        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });
        self.api()
            .patch_status(
                OPERATOR_CONFIG_NAME,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl OperatorState for KubeOperatorState {
    fn get(&self) -> Result<Arc<OpenShiftAPIServer>, Error> {
        self.cache
            .get(OPERATOR_CONFIG_NAME)
            .ok_or_else(|| Error::not_found("OpenShiftAPIServer", OPERATOR_CONFIG_NAME))
    }

    async fn update_conditions(&self, conditions: Vec<OperatorCondition>) -> Result<bool, Error> {
        let config = RetryConfig::with_max_attempts(WRITE_ATTEMPTS);
        retry_with_backoff(&config, "update_operator_conditions", Error::is_conflict, || {
            let conditions = conditions.clone();
            async move {
                let live = self.api().get_status(OPERATOR_CONFIG_NAME).await?;
                let mut merged = live.conditions().to_vec();
                let mut changed = false;
                for condition in conditions {
                    changed |= set_condition(&mut merged, condition);
                }
                if !changed {
                    return Ok(false);
                }
                debug!(conditions = merged.len(), "Updating operator conditions");
                self.patch_status(
                    live.metadata.resource_version.clone(),
                    json!({ "conditions": merged }),
                )
                .await?;
                Ok(true)
            }
        })
        .await
    }

    async fn update_workload_status(
        &self,
        ready_replicas: i32,
        version: Option<String>,
    ) -> Result<(), Error> {
        let config = RetryConfig::with_max_attempts(WRITE_ATTEMPTS);
        retry_with_backoff(&config, "update_workload_status", Error::is_conflict, || {
            let version = version.clone();
            async move {
                let live = self.api().get_status(OPERATOR_CONFIG_NAME).await?;
                let current = live.status.clone().unwrap_or_default();
                let version = version.or(current.version.clone());
                let generation = live.metadata.generation;
                if current.ready_replicas == ready_replicas
                    && current.version == version
                    && current.observed_generation == generation
                {
                    return Ok(());
                }
                self.patch_status(
                    live.metadata.resource_version.clone(),
                    json!({
                        "readyReplicas": ready_replicas,
                        "version": version,
                        "observedGeneration": generation,
                    }),
                )
                .await
            }
        })
        .await
    }

    async fn set_observed_config(&self, config: serde_json::Value) -> Result<bool, Error> {
        let retry = RetryConfig::with_max_attempts(WRITE_ATTEMPTS);
        retry_with_backoff(&retry, "set_observed_config", Error::is_conflict, || {
            let config = config.clone();
            async move {
                let mut live = self.api().get(OPERATOR_CONFIG_NAME).await?;
                if live.spec.observed_config.as_ref() == Some(&config) {
                    return Ok(false);
                }
                // Full replace: a merge patch would keep keys that are no
                // longer observed
                live.spec.observed_config = Some(config);
                self.api()
                    .replace(OPERATOR_CONFIG_NAME, &PostParams::default(), &live)
                    .await?;
                Ok(true)
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_sync_is_not_degraded() {
        let cond = degraded_condition("WorkloadDegraded", None);
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.reason.as_deref(), Some("AsExpected"));
        assert!(cond.message.is_none());
    }

    #[test]
    fn failed_sync_is_degraded_with_message() {
        let err = Error::not_found("ConfigMap", "openshift-config/etcd-serving-ca");
        let cond = degraded_condition("ResourceSyncControllerDegraded", Some(&err));
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.reason.as_deref(), Some("SyncError"));
        assert!(cond.message.unwrap().contains("etcd-serving-ca"));
    }

    #[test]
    fn mock_can_stand_in_for_operator_state() {
        let mut mock = MockOperatorState::new();
        mock.expect_get().returning(|| {
            Ok(Arc::new(OpenShiftAPIServer::new(
                "cluster",
                Default::default(),
            )))
        });
        let state: &dyn OperatorState = &mock;
        assert_eq!(state.get().unwrap().metadata.name.as_deref(), Some("cluster"));
    }
}
