//! Leader election using Kubernetes Leases
//!
//! Only the lease holder runs controllers. Acquisition and renewal use the
//! lease's resourceVersion for compare-and-swap: if the lease changes between
//! read and write the update fails with 409 Conflict and is treated as "not
//! acquired". Losing the lease cancels the process-wide shutdown token, which
//! stops the operator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::kube_utils::{is_conflict, is_not_found};

/// Lease name for operator leader election
pub const LEADER_LEASE_NAME: &str = "openshift-apiserver-operator-lock";

const LEASE_DURATION: Duration = Duration::from_secs(137);
const RENEW_INTERVAL: Duration = Duration::from_secs(26);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The lease came back without a resourceVersion
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// What to do with the lease as currently observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAction {
    /// No lease exists yet
    Create,
    /// We hold it; bump the renew time
    Renew,
    /// Someone else held it but it expired
    TakeOver {
        /// Transition count to record after takeover
        transitions: i32,
    },
    /// Held by someone else and still valid
    Wait,
}

/// Decide how `identity` should act on the observed lease at `now`
pub fn lease_action(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let Some(lease) = lease else {
        return LeaseAction::Create;
    };
    let spec = lease.spec.as_ref();
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(identity) {
        return LeaseAction::Renew;
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (holder, renew_time, duration_secs) {
        (None, _, _) => true,
        (Some(_), Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
        _ => true,
    };

    if expired {
        LeaseAction::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0) + 1,
        }
    } else {
        LeaseAction::Wait
    }
}

/// Leader elector using a Kubernetes Lease
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// Create an elector with default timing
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether this elector currently holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Block until leadership is acquired or `shutdown` fires.
    ///
    /// On success the returned guard keeps renewing the lease; if renewal
    /// fails `shutdown` is cancelled. Returns `None` if shut down first.
    pub async fn acquire(self: Arc<Self>, shutdown: CancellationToken) -> Option<LeaderGuard> {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "Waiting for leadership..."
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return Some(self.create_guard(shutdown));
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = self.retry_interval.as_secs(),
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.retry_interval.as_secs(),
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    fn create_guard(self: &Arc<Self>, shutdown: CancellationToken) -> LeaderGuard {
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(shutdown).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let existing = match api.get(&self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(e) if is_not_found(&e) => None,
            Err(e) => return Err(e.into()),
        };

        match lease_action(existing.as_ref(), &self.identity, now) {
            LeaseAction::Create => self.write_lease(&api, None, now, now, 0).await,
            LeaseAction::Renew => {
                let Some(lease) = existing else {
                    return Ok(false);
                };
                let acquired = lease
                    .spec
                    .as_ref()
                    .and_then(|s| s.acquire_time.as_ref())
                    .map(|t| t.0)
                    .unwrap_or(now);
                let transitions = lease
                    .spec
                    .as_ref()
                    .and_then(|s| s.lease_transitions)
                    .unwrap_or(0);
                let rv = self.resource_version(&lease)?;
                self.write_lease(&api, Some(rv), acquired, now, transitions)
                    .await
            }
            LeaseAction::TakeOver { transitions } => {
                let Some(lease) = existing else {
                    return Ok(false);
                };
                let rv = self.resource_version(&lease)?;
                let taken = self
                    .write_lease(&api, Some(rv), now, now, transitions)
                    .await?;
                if taken {
                    info!(identity = %self.identity, transitions, "Took over expired lease");
                }
                Ok(taken)
            }
            LeaseAction::Wait => Ok(false),
        }
    }

    fn resource_version(&self, lease: &Lease) -> Result<String, LeaderElectionError> {
        lease
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| LeaderElectionError::MissingResourceVersion(self.lease_name.clone()))
    }

    /// Create (no resourceVersion) or compare-and-swap replace the lease
    async fn write_lease(
        &self,
        api: &Api<Lease>,
        resource_version: Option<String>,
        acquired: DateTime<Utc>,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Result<bool, LeaderElectionError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: resource_version.clone(),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(acquired)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        };

        let result = match resource_version {
            None => api.create(&PostParams::default(), &lease).await,
            Some(_) => {
                api.replace(&self.lease_name, &PostParams::default(), &lease)
                    .await
            }
        };

        match result {
            Ok(_) => {
                debug!(identity = %self.identity, "Lease written");
                Ok(true)
            }
            Err(e) if is_conflict(&e) => {
                debug!(identity = %self.identity, "Lease write conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renewal_loop(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.renew_interval) => {}
            }

            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "Leadership lost, stopping");
                    self.is_leader.store(false, Ordering::SeqCst);
                    shutdown.cancel();
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let lease = match api.get(&self.lease_name).await {
            Ok(l) => l,
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            return Ok(());
        }

        let patch = json!({
            "metadata": { "resourceVersion": lease.metadata.resource_version },
            "spec": { "holderIdentity": null }
        });
        api.patch(
            &self.lease_name,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;

        info!(identity = %self.identity, "Lease released");
        Ok(())
    }
}

/// Guard that maintains leadership while alive
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
}

impl LeaderGuard {
    /// Give up the lease (call during graceful shutdown)
    pub async fn release(&self) -> Result<(), LeaderElectionError> {
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: Option<&str>, renewed_secs_ago: i64, duration: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(LEADER_LEASE_NAME.to_string()),
                resource_version: Some("7".to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_string),
                lease_duration_seconds: Some(duration),
                renew_time: Some(MicroTime(
                    Utc::now() - chrono::Duration::seconds(renewed_secs_ago),
                )),
                lease_transitions: Some(2),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn missing_lease_is_created() {
        assert_eq!(lease_action(None, "pod-a", Utc::now()), LeaseAction::Create);
    }

    #[test]
    fn own_lease_is_renewed() {
        let l = lease(Some("pod-a"), 5, 137);
        assert_eq!(lease_action(Some(&l), "pod-a", Utc::now()), LeaseAction::Renew);
    }

    #[test]
    fn valid_foreign_lease_waits() {
        let l = lease(Some("pod-b"), 5, 137);
        assert_eq!(lease_action(Some(&l), "pod-a", Utc::now()), LeaseAction::Wait);
    }

    #[test]
    fn expired_foreign_lease_is_taken_over() {
        let l = lease(Some("pod-b"), 300, 137);
        assert_eq!(
            lease_action(Some(&l), "pod-a", Utc::now()),
            LeaseAction::TakeOver { transitions: 3 }
        );
    }

    #[test]
    fn released_lease_is_taken_over() {
        let l = lease(None, 1, 137);
        assert!(matches!(
            lease_action(Some(&l), "pod-a", Utc::now()),
            LeaseAction::TakeOver { .. }
        ));
    }
}
