//! Watch-cache factories
//!
//! An [`InformerFactory`] hands out reflector-backed caches for one API group
//! (optionally restricted to one namespace). Caches are registered lazily by
//! the controllers that consume them and only begin synchronizing once the
//! factory is started. Each factory is started exactly once; types registered
//! after start begin synchronizing immediately.
//!
//! Consumers receive an [`Informer`] handle: a read-only view of the cache plus
//! a change-notification channel used to trigger controller syncs.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the per-informer change channel. Receivers that lag simply
/// see one coalesced notification.
const CHANGE_BUFFER: usize = 16;

/// A source of change notifications a controller can be triggered by
pub trait Watched: Send + Sync {
    /// Short name used in logs
    fn kind(&self) -> &str;

    /// Receive a notification whenever the watched state changes
    fn subscribe(&self) -> broadcast::Receiver<()>;

    /// Resolves to true once the initial state is available, false if it
    /// never will be
    fn ready(&self) -> BoxFuture<'static, bool>;
}

/// Something holding background cache synchronization that must be started
/// before consumers read from it
pub trait CacheFactory: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Begin synchronizing every registered cache until `shutdown` fires.
    /// Non-blocking.
    fn start(&self, shutdown: CancellationToken);
}

/// Cached, eventually-consistent view of one resource type
pub struct Informer<K>
where
    K: Resource<DynamicType = ()> + 'static,
{
    kind: String,
    store: Store<K>,
    changes: broadcast::Sender<()>,
}

impl<K> Clone for Informer<K>
where
    K: Resource<DynamicType = ()> + 'static,
{
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            store: self.store.clone(),
            changes: self.changes.clone(),
        }
    }
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    /// The underlying reflector store
    pub fn store(&self) -> &Store<K> {
        &self.store
    }

    /// Get a cluster-scoped object (or any object when the cache is
    /// restricted to a single namespace and the namespace is implied)
    pub fn get(&self, name: &str) -> Option<Arc<K>> {
        self.store.get(&ObjectRef::new(name))
    }

    /// Get a namespaced object
    pub fn get_namespaced(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.store.get(&ObjectRef::new(name).within(namespace))
    }

    /// Every cached object
    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.state()
    }

    /// Every cached object in `namespace`
    pub fn list_namespaced(&self, namespace: &str) -> Vec<Arc<K>> {
        self.store
            .state()
            .into_iter()
            .filter(|obj| obj.meta().namespace.as_deref() == Some(namespace))
            .collect()
    }

    /// Wait until the initial list has been loaded
    pub async fn wait_until_ready(&self) -> bool {
        self.store.wait_until_ready().await.is_ok()
    }
}

impl<K> Watched for Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }

    fn ready(&self) -> BoxFuture<'static, bool> {
        let store = self.store.clone();
        async move { store.wait_until_ready().await.is_ok() }.boxed()
    }
}

struct FactoryState {
    informers: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    pending: Vec<BoxFuture<'static, ()>>,
    shutdown: Option<CancellationToken>,
}

/// Shared cache factory for one API group
pub struct InformerFactory {
    name: String,
    client: Client,
    namespace: Option<String>,
    state: Mutex<FactoryState>,
}

impl InformerFactory {
    /// Create a factory whose namespaced caches span all namespaces
    pub fn new(name: impl Into<String>, client: Client) -> Self {
        Self::with_namespace(name, client, None)
    }

    /// Create a factory whose namespaced caches are restricted to `namespace`
    pub fn with_namespace(
        name: impl Into<String>,
        client: Client,
        namespace: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            namespace,
            state: Mutex::new(FactoryState {
                informers: HashMap::new(),
                pending: Vec::new(),
                shutdown: None,
            }),
        }
    }

    /// Namespace this factory is restricted to, if any
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Cache for a namespaced resource type
    pub fn informer<K>(&self) -> Informer<K>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
    {
        let api = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        self.register(api)
    }

    /// Cache for a cluster-scoped resource type
    pub fn cluster_informer<K>(&self) -> Informer<K>
    where
        K: Resource<DynamicType = (), Scope = ClusterResourceScope>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
    {
        self.register(Api::all(self.client.clone()))
    }

    /// Number of resource types registered so far
    pub fn registered(&self) -> usize {
        self.state.lock().informers.len()
    }

    /// Whether `start` has been called
    pub fn is_started(&self) -> bool {
        self.state.lock().shutdown.is_some()
    }

    fn register<K>(&self, api: Api<K>) -> Informer<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        if let Some(existing) = state
            .informers
            .get(&TypeId::of::<K>())
            .and_then(|any| any.downcast_ref::<Informer<K>>())
        {
            return existing.clone();
        }

        let (store, writer) = reflector::store();
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        let informer = Informer {
            kind: K::kind(&()).to_string(),
            store,
            changes: changes.clone(),
        };
        state
            .informers
            .insert(TypeId::of::<K>(), Box::new(informer.clone()));

        debug!(factory = %self.name, kind = %informer.kind, "Registered informer");

        let task = watch_task(self.name.clone(), informer.kind.clone(), api, writer, changes);
        match &state.shutdown {
            Some(token) => spawn_until_cancelled(task, token.clone()),
            None => state.pending.push(task),
        }
        informer
    }
}

impl CacheFactory for InformerFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, shutdown: CancellationToken) {
        let mut state = self.state.lock();
        if state.shutdown.is_some() {
            warn!(factory = %self.name, "Informer factory already started, ignoring");
            return;
        }
        let pending = std::mem::take(&mut state.pending);
        info!(factory = %self.name, informers = pending.len(), "Starting informers");
        for task in pending {
            spawn_until_cancelled(task, shutdown.clone());
        }
        state.shutdown = Some(shutdown);
    }
}

fn watch_task<K>(
    factory: String,
    kind: String,
    api: Api<K>,
    writer: reflector::store::Writer<K>,
    changes: broadcast::Sender<()>,
) -> BoxFuture<'static, ()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async move {
        let stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .touched_objects();
        let mut stream = std::pin::pin!(stream);
        while let Some(item) = stream.next().await {
            match item {
                // No receivers just means no controller watches this type yet
                Ok(_) => {
                    let _ = changes.send(());
                }
                Err(e) => {
                    warn!(factory = %factory, kind = %kind, error = %e, "Watch stream error");
                }
            }
        }
    }
    .boxed()
}

fn spawn_until_cancelled(task: BoxFuture<'static, ()>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = task => {}
        }
    });
}

/// One cache factory per relevant namespace
///
/// The empty namespace `""` denotes a factory spanning all namespaces.
pub struct NamespacedInformers {
    factories: BTreeMap<String, Arc<InformerFactory>>,
}

impl NamespacedInformers {
    /// Create factories for each namespace in `namespaces`
    pub fn new(client: Client, namespaces: &[&str]) -> Self {
        let factories = namespaces
            .iter()
            .map(|ns| {
                let namespace = (!ns.is_empty()).then(|| ns.to_string());
                let name = if ns.is_empty() {
                    "kube[all]".to_string()
                } else {
                    format!("kube[{}]", ns)
                };
                (
                    ns.to_string(),
                    Arc::new(InformerFactory::with_namespace(
                        name,
                        client.clone(),
                        namespace,
                    )),
                )
            })
            .collect();
        Self { factories }
    }

    /// Factory for `namespace`, if it was configured
    pub fn for_namespace(&self, namespace: &str) -> Option<&Arc<InformerFactory>> {
        self.factories.get(namespace)
    }

    /// Configured namespaces
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl CacheFactory for NamespacedInformers {
    fn name(&self) -> &str {
        "kube"
    }

    fn start(&self, shutdown: CancellationToken) {
        for factory in self.factories.values() {
            factory.start(shutdown.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace};

    fn offline_client() -> Client {
        let config = kube::Config::new("http://127.0.0.1:9".parse().unwrap());
        Client::try_from(config).unwrap()
    }

    #[tokio::test]
    async fn same_type_registers_once() {
        let factory = InformerFactory::new("test", offline_client());
        let _a = factory.informer::<ConfigMap>();
        let _b = factory.informer::<ConfigMap>();
        let _ns = factory.cluster_informer::<Namespace>();
        assert_eq!(factory.registered(), 2);
    }

    #[tokio::test]
    async fn start_is_one_shot() {
        let factory = InformerFactory::new("test", offline_client());
        let _cms = factory.informer::<ConfigMap>();
        let token = CancellationToken::new();

        assert!(!factory.is_started());
        factory.start(token.clone());
        assert!(factory.is_started());
        // Second start is ignored rather than spawning duplicate watches
        factory.start(token.clone());
        assert!(factory.is_started());

        token.cancel();
    }

    #[tokio::test]
    async fn unsynced_cache_is_empty() {
        let factory = InformerFactory::new("test", offline_client());
        let cms = factory.informer::<ConfigMap>();
        assert!(cms.list().is_empty());
        assert!(cms.get_namespaced("openshift-config", "missing").is_none());
        assert_eq!(cms.kind(), "ConfigMap");
    }

    #[tokio::test]
    async fn namespaced_informers_cover_all_namespaces() {
        let informers = NamespacedInformers::new(
            offline_client(),
            &["", "openshift-config", "openshift-apiserver"],
        );
        assert!(informers.for_namespace("").unwrap().namespace().is_none());
        assert_eq!(
            informers
                .for_namespace("openshift-config")
                .unwrap()
                .namespace(),
            Some("openshift-config")
        );
        assert!(informers.for_namespace("kube-system").is_none());
        assert_eq!(informers.namespaces().count(), 3);

        let token = CancellationToken::new();
        informers.start(token.clone());
        assert!(informers
            .for_namespace("openshift-apiserver")
            .unwrap()
            .is_started());
        token.cancel();
    }
}
