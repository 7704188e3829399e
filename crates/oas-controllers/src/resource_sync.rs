//! Resource-sync controller
//!
//! Mirrors ConfigMaps and Secrets from the global config namespaces into the
//! target namespace. Rules map a destination to a source; when the source
//! disappears, or the rule's source is empty, the destination is deleted.
//! Other controllers add rules at
//! runtime through [`ResourceSyncer`], which triggers a sync.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::{get, MethodRouter};
use axum::Json;
use futures::future::BoxFuture;
use futures::FutureExt;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, instrument};

use oas_common::events::reasons;
use oas_common::kube_utils::{apply_namespaced, delete_namespaced};
use oas_common::{
    Error, EventRecorder, Informer, NamespacedInformers, Watched,
    GLOBAL_USER_SPECIFIED_CONFIG_NAMESPACE, TARGET_NAMESPACE,
};

use crate::operator_client::{degraded_condition, OperatorState};
use crate::runner::Reconciler;

const CONTROLLER_NAME: &str = "ResourceSyncController";
const DEGRADED_CONDITION: &str = "ResourceSyncControllerDegraded";

/// Namespace-qualified object name
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResourceLocation {
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl ResourceLocation {
    /// Create a location
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The empty location. As a source it means "the destination must not exist".
    pub fn empty() -> Self {
        Self::new("", "")
    }

    /// Whether this is the empty location
    pub fn is_empty(&self) -> bool {
        self.namespace.is_empty() && self.name.is_empty()
    }
}

impl std::fmt::Display for ResourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One destination and where it is copied from
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SyncRule {
    /// Object written by the controller
    pub destination: ResourceLocation,
    /// Object copied from
    pub source: ResourceLocation,
}

/// Current rules, as served by the debug endpoint
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRules {
    /// ConfigMap rules
    pub config_maps: Vec<SyncRule>,
    /// Secret rules
    pub secrets: Vec<SyncRule>,
}

/// Registration of sync rules
pub trait ResourceSyncer: Send + Sync {
    /// Keep `destination` a copy of the ConfigMap at `source`
    fn sync_config_map(
        &self,
        destination: ResourceLocation,
        source: ResourceLocation,
    ) -> Result<(), Error>;

    /// Keep `destination` a copy of the Secret at `source`
    fn sync_secret(&self, destination: ResourceLocation, source: ResourceLocation)
        -> Result<(), Error>;
}

#[derive(Default)]
struct RuleTable {
    config_maps: BTreeMap<ResourceLocation, ResourceLocation>,
    secrets: BTreeMap<ResourceLocation, ResourceLocation>,
}

fn to_rules(table: &BTreeMap<ResourceLocation, ResourceLocation>) -> Vec<SyncRule> {
    table
        .iter()
        .map(|(destination, source)| SyncRule {
            destination: destination.clone(),
            source: source.clone(),
        })
        .collect()
}

/// Rules every controller instance starts with: the etcd CA bundle and
/// client certificate
pub fn default_sync_rules() -> SyncRules {
    SyncRules {
        config_maps: vec![SyncRule {
            destination: ResourceLocation::new(TARGET_NAMESPACE, "etcd-serving-ca"),
            source: ResourceLocation::new(GLOBAL_USER_SPECIFIED_CONFIG_NAMESPACE, "etcd-serving-ca"),
        }],
        secrets: vec![SyncRule {
            destination: ResourceLocation::new(TARGET_NAMESPACE, "etcd-client"),
            source: ResourceLocation::new(GLOBAL_USER_SPECIFIED_CONFIG_NAMESPACE, "etcd-client"),
        }],
    }
}

/// Mirrors ConfigMaps and Secrets according to registered rules
pub struct ResourceSyncController {
    client: Client,
    operator: Arc<dyn OperatorState>,
    informers: Arc<NamespacedInformers>,
    events: Arc<dyn EventRecorder>,
    rules: RwLock<RuleTable>,
    changes: broadcast::Sender<()>,
}

impl ResourceSyncController {
    /// Create the controller with the default etcd rules
    pub fn new(
        client: Client,
        operator: Arc<dyn OperatorState>,
        informers: Arc<NamespacedInformers>,
        events: Arc<dyn EventRecorder>,
    ) -> Result<Self, Error> {
        let (changes, _) = broadcast::channel(8);
        let controller = Self {
            client,
            operator,
            informers,
            events,
            rules: RwLock::new(RuleTable::default()),
            changes,
        };
        let defaults = default_sync_rules();
        for rule in defaults.config_maps {
            controller.sync_config_map(rule.destination, rule.source)?;
        }
        for rule in defaults.secrets {
            controller.sync_secret(rule.destination, rule.source)?;
        }
        Ok(controller)
    }

    /// Snapshot of the registered rules
    pub fn rules(&self) -> SyncRules {
        let rules = self.rules.read();
        SyncRules {
            config_maps: to_rules(&rules.config_maps),
            secrets: to_rules(&rules.secrets),
        }
    }

    /// Handler serving the current rules as JSON
    pub fn debug_handler(self: &Arc<Self>) -> MethodRouter {
        let controller = Arc::clone(self);
        get(move || {
            let controller = Arc::clone(&controller);
            async move { Json(controller.rules()) }
        })
    }

    fn config_maps(&self, namespace: &str) -> Result<Informer<ConfigMap>, Error> {
        self.informers
            .for_namespace(namespace)
            .map(|factory| factory.informer::<ConfigMap>())
            .ok_or_else(|| Error::Config(format!("namespace {} is not watched", namespace)))
    }

    fn secrets(&self, namespace: &str) -> Result<Informer<Secret>, Error> {
        self.informers
            .for_namespace(namespace)
            .map(|factory| factory.informer::<Secret>())
            .ok_or_else(|| Error::Config(format!("namespace {} is not watched", namespace)))
    }

    async fn sync_config_map_rule(
        &self,
        destination: &ResourceLocation,
        source: &ResourceLocation,
    ) -> Result<(), Error> {
        let current = self
            .config_maps(&destination.namespace)?
            .get_namespaced(&destination.namespace, &destination.name);
        let source_obj = if source.is_empty() {
            None
        } else {
            self.config_maps(&source.namespace)?
                .get_namespaced(&source.namespace, &source.name)
        };
        let Some(source_obj) = source_obj else {
            if current.is_some()
                && delete_namespaced::<ConfigMap>(&self.client, &destination.namespace, &destination.name)
                    .await?
            {
                self.events
                    .event(
                        reasons::SYNC_TARGET_DELETED,
                        format!("Deleted ConfigMap {} because source {} is missing", destination, source),
                    )
                    .await;
            }
            return Ok(());
        };

        let desired = ConfigMap {
            metadata: destination_meta(destination),
            data: source_obj.data.clone(),
            binary_data: source_obj.binary_data.clone(),
            ..Default::default()
        };
        let unchanged = current
            .as_ref()
            .is_some_and(|c| c.data == desired.data && c.binary_data == desired.binary_data);
        if unchanged {
            return Ok(());
        }

        apply_namespaced(&self.client, &destination.namespace, &desired).await?;
        self.events
            .event(
                reasons::CONFIGMAP_SYNCED,
                format!("Synced ConfigMap {} from {}", destination, source),
            )
            .await;
        Ok(())
    }

    async fn sync_secret_rule(
        &self,
        destination: &ResourceLocation,
        source: &ResourceLocation,
    ) -> Result<(), Error> {
        let current = self
            .secrets(&destination.namespace)?
            .get_namespaced(&destination.namespace, &destination.name);
        let source_obj = if source.is_empty() {
            None
        } else {
            self.secrets(&source.namespace)?
                .get_namespaced(&source.namespace, &source.name)
        };
        let Some(source_obj) = source_obj else {
            if current.is_some()
                && delete_namespaced::<Secret>(&self.client, &destination.namespace, &destination.name)
                    .await?
            {
                self.events
                    .event(
                        reasons::SYNC_TARGET_DELETED,
                        format!("Deleted Secret {} because source {} is missing", destination, source),
                    )
                    .await;
            }
            return Ok(());
        };

        let desired = Secret {
            metadata: destination_meta(destination),
            data: source_obj.data.clone(),
            type_: source_obj.type_.clone(),
            ..Default::default()
        };
        let unchanged = current
            .as_ref()
            .is_some_and(|c| c.data == desired.data && c.type_ == desired.type_);
        if unchanged {
            return Ok(());
        }

        apply_namespaced(&self.client, &destination.namespace, &desired).await?;
        // Secret contents never go into events
        self.events
            .event(
                reasons::SECRET_SYNCED,
                format!("Synced Secret {} from {}", destination, source),
            )
            .await;
        Ok(())
    }

    fn add_rule(
        &self,
        kind: &str,
        select: impl FnOnce(&mut RuleTable) -> &mut BTreeMap<ResourceLocation, ResourceLocation>,
        destination: ResourceLocation,
        source: ResourceLocation,
    ) -> Result<(), Error> {
        validate_rule(&destination, &source)?;
        let changed = {
            let mut rules = self.rules.write();
            let table = select(&mut *rules);
            table.insert(destination.clone(), source.clone()).as_ref() != Some(&source)
        };
        if changed {
            debug!(kind, %destination, %source, "Registered sync rule");
            let _ = self.changes.send(());
        }
        Ok(())
    }
}

fn destination_meta(destination: &ResourceLocation) -> ObjectMeta {
    ObjectMeta {
        name: Some(destination.name.clone()),
        namespace: Some(destination.namespace.clone()),
        ..Default::default()
    }
}

fn validate_rule(destination: &ResourceLocation, source: &ResourceLocation) -> Result<(), Error> {
    if destination.namespace.is_empty() || destination.name.is_empty() {
        return Err(Error::Config(format!("invalid sync destination {:?}", destination)));
    }
    if !source.is_empty() && (source.namespace.is_empty() || source.name.is_empty()) {
        return Err(Error::Config(format!("invalid sync source {:?}", source)));
    }
    if destination == source {
        return Err(Error::Config(format!("{} cannot be synced onto itself", destination)));
    }
    Ok(())
}

impl ResourceSyncer for ResourceSyncController {
    fn sync_config_map(
        &self,
        destination: ResourceLocation,
        source: ResourceLocation,
    ) -> Result<(), Error> {
        self.add_rule("ConfigMap", |t| &mut t.config_maps, destination, source)
    }

    fn sync_secret(
        &self,
        destination: ResourceLocation,
        source: ResourceLocation,
    ) -> Result<(), Error> {
        self.add_rule("Secret", |t| &mut t.secrets, destination, source)
    }
}

impl Watched for ResourceSyncController {
    fn kind(&self) -> &str {
        "SyncRules"
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }

    fn ready(&self) -> BoxFuture<'static, bool> {
        futures::future::ready(true).boxed()
    }
}

#[async_trait]
impl Reconciler for ResourceSyncController {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    #[instrument(skip(self), fields(controller = CONTROLLER_NAME))]
    async fn sync(&self) -> Result<(), Error> {
        let rules = self.rules();
        let mut failures = Vec::new();

        for rule in &rules.config_maps {
            if let Err(e) = self.sync_config_map_rule(&rule.destination, &rule.source).await {
                failures.push(format!("configmap {}: {}", rule.destination, e));
            }
        }
        for rule in &rules.secrets {
            if let Err(e) = self.sync_secret_rule(&rule.destination, &rule.source).await {
                failures.push(format!("secret {}: {}", rule.destination, e));
            }
        }

        let result = if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::sync(CONTROLLER_NAME, failures.join("; ")))
        };
        self.operator
            .update_conditions(vec![degraded_condition(DEGRADED_CONDITION, result.as_ref().err())])
            .await?;
        result
    }
}
