//! Cluster-status controller
//!
//! Folds the per-controller conditions of the operator configuration into the
//! four public conditions of the `ClusterOperator` record, and publishes the
//! version ledger and the related-object list alongside them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::{debug, info, instrument};

use oas_common::crd::{
    ClusterOperator, ClusterOperatorSpec, ClusterOperatorStatus, ClusterOperatorStatusCondition,
    ConditionStatus, ManagementState, ObjectReference, OperandVersion, OperatorCondition,
};
use oas_common::events::reasons;
use oas_common::{Error, EventRecorder, Informer, VersionLedger};

use crate::operator_client::OperatorState;
use crate::runner::Reconciler;

const CONTROLLER_NAME: &str = "StatusSyncer";

/// Public condition types, in publication order
pub const CLUSTER_CONDITION_TYPES: [&str; 4] = ["Degraded", "Progressing", "Available", "Upgradeable"];

/// How one public condition is derived from the controller conditions that
/// share its suffix
struct Fold {
    suffix: &'static str,
    /// Status a matching condition must have to trip the public condition
    trigger: ConditionStatus,
    /// Public status when nothing trips
    healthy: ConditionStatus,
}

const FOLDS: [Fold; 4] = [
    Fold {
        suffix: "Degraded",
        trigger: ConditionStatus::True,
        healthy: ConditionStatus::False,
    },
    Fold {
        suffix: "Progressing",
        trigger: ConditionStatus::True,
        healthy: ConditionStatus::False,
    },
    Fold {
        suffix: "Available",
        trigger: ConditionStatus::False,
        healthy: ConditionStatus::True,
    },
    Fold {
        suffix: "Upgradeable",
        trigger: ConditionStatus::False,
        healthy: ConditionStatus::True,
    },
];

fn public_condition(
    type_: &str,
    status: ConditionStatus,
    reason: impl Into<String>,
    message: Option<String>,
) -> ClusterOperatorStatusCondition {
    ClusterOperatorStatusCondition {
        type_: type_.to_string(),
        status,
        reason: Some(reason.into()),
        message,
        last_transition_time: Some(Utc::now()),
    }
}

/// Fold controller conditions into the public conditions
pub fn aggregate_conditions(
    conditions: &[OperatorCondition],
    state: ManagementState,
) -> Vec<ClusterOperatorStatusCondition> {
    if matches!(state, ManagementState::Unmanaged | ManagementState::Removed) {
        let reason = format!("{:?}", state);
        return CLUSTER_CONDITION_TYPES
            .iter()
            .map(|t| public_condition(t, ConditionStatus::Unknown, reason.clone(), None))
            .collect();
    }

    FOLDS
        .iter()
        .map(|fold| {
            let mut tripped: Vec<&OperatorCondition> = conditions
                .iter()
                .filter(|c| c.type_.ends_with(fold.suffix) && c.status == fold.trigger)
                .collect();
            tripped.sort_by(|a, b| a.type_.cmp(&b.type_));

            match tripped.as_slice() {
                [] => public_condition(fold.suffix, fold.healthy, "AsExpected", None),
                [only] => {
                    let prefix = only.type_.trim_end_matches(fold.suffix);
                    let reason = match &only.reason {
                        Some(r) if !prefix.is_empty() => format!("{}_{}", prefix, r),
                        Some(r) => r.clone(),
                        None => prefix.to_string(),
                    };
                    public_condition(fold.suffix, fold.trigger, reason, only.message.clone())
                }
                many => {
                    let message = many
                        .iter()
                        .map(|c| format!("{}: {}", c.type_, c.message.as_deref().unwrap_or("")))
                        .collect::<Vec<_>>()
                        .join("\n");
                    public_condition(
                        fold.suffix,
                        fold.trigger,
                        "MultipleConditionsMatching",
                        Some(message),
                    )
                }
            }
        })
        .collect()
}

/// Keep the previous transition time of every condition whose status did not
/// change
pub fn carry_transition_times(
    conditions: &mut [ClusterOperatorStatusCondition],
    previous: &[ClusterOperatorStatusCondition],
) {
    for condition in conditions.iter_mut() {
        if let Some(old) = previous
            .iter()
            .find(|p| p.type_ == condition.type_ && p.status == condition.status)
        {
            condition.last_transition_time = old.last_transition_time;
        }
    }
}

/// Human-readable descriptions of every version that changed
pub fn version_changes(previous: &[OperandVersion], current: &[OperandVersion]) -> Vec<String> {
    let old: BTreeMap<&str, &str> = previous
        .iter()
        .map(|v| (v.name.as_str(), v.version.as_str()))
        .collect();
    current
        .iter()
        .filter_map(|v| match old.get(v.name.as_str()) {
            Some(prev) if *prev == v.version => None,
            Some(prev) => Some(format!(
                "{:?} changed from {:?} to {:?}",
                v.name, prev, v.version
            )),
            None => Some(format!("{:?} changed from \"\" to {:?}", v.name, v.version)),
        })
        .collect()
}

/// Publishes the operator's aggregated status
pub struct ClusterStatusController {
    name: String,
    client: Client,
    operator: Arc<dyn OperatorState>,
    cluster_operators: Informer<ClusterOperator>,
    ledger: Arc<VersionLedger>,
    related_objects: Vec<ObjectReference>,
    events: Arc<dyn EventRecorder>,
}

impl ClusterStatusController {
    /// Create the controller publishing to the ClusterOperator `name`
    pub fn new(
        name: impl Into<String>,
        client: Client,
        operator: Arc<dyn OperatorState>,
        cluster_operators: Informer<ClusterOperator>,
        ledger: Arc<VersionLedger>,
        related_objects: Vec<ObjectReference>,
        events: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            operator,
            cluster_operators,
            ledger,
            related_objects,
            events,
        }
    }

    /// Related objects this controller publishes
    pub fn related_objects(&self) -> &[ObjectReference] {
        &self.related_objects
    }

    fn desired_status(&self, previous: Option<&ClusterOperatorStatus>) -> Result<ClusterOperatorStatus, Error> {
        let operator = self.operator.get()?;
        let mut conditions = aggregate_conditions(operator.conditions(), operator.management_state());
        if let Some(previous) = previous {
            carry_transition_times(&mut conditions, &previous.conditions);
        }

        let versions = self
            .ledger
            .versions()
            .into_iter()
            .map(|(name, version)| OperandVersion { name, version })
            .collect();

        Ok(ClusterOperatorStatus {
            conditions,
            versions,
            related_objects: self.related_objects.clone(),
        })
    }

    async fn create(&self, api: &Api<ClusterOperator>) -> Result<ClusterOperator, Error> {
        let created = api
            .create(
                &PostParams::default(),
                &ClusterOperator::new(&self.name, ClusterOperatorSpec::default()),
            )
            .await?;
        info!(clusteroperator = %self.name, "Created ClusterOperator");
        self.events
            .event(
                reasons::CLUSTER_OPERATOR_CREATED,
                format!("Created clusteroperator/{} because it was missing", self.name),
            )
            .await;
        Ok(created)
    }
}

#[async_trait]
impl Reconciler for ClusterStatusController {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    #[instrument(skip(self), fields(controller = CONTROLLER_NAME))]
    async fn sync(&self) -> Result<(), Error> {
        let api: Api<ClusterOperator> = Api::all(self.client.clone());
        let current = match self.cluster_operators.get(&self.name) {
            Some(existing) => (*existing).clone(),
            None => self.create(&api).await?,
        };

        let previous = current.status.clone();
        let desired = self.desired_status(previous.as_ref())?;
        if previous.as_ref() == Some(&desired) {
            debug!("ClusterOperator status up to date");
            return Ok(());
        }

        let patch = json!({
            "metadata": { "resourceVersion": current.metadata.resource_version },
            "status": desired,
        });
        api.patch_status(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        let changes = version_changes(current.versions(), &desired.versions);
        if !changes.is_empty() {
            self.events
                .event(
                    reasons::OPERATOR_VERSION_CHANGED,
                    format!("clusteroperator/{} version {}", self.name, changes.join(", ")),
                )
                .await;
        }
        Ok(())
    }
}
