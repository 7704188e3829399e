//! Startup sequence up to the point where the orchestrator takes over
//!
//! Clients, caches, version seeding and controller wiring. Any fault here is
//! fatal and nothing constructed so far is left running: caches are only
//! started by the [`Orchestrator`](crate::orchestrator::Orchestrator).

mod clients;
mod informers;
mod versions;
mod wiring;

use std::sync::Arc;

use tracing::info;

use oas_common::{KubeEventRecorder, VersionLedger, CLUSTER_OPERATOR_NAME};
use oas_controllers::LogLevelSetter;

pub use clients::{ApiGroup, ClientProvider, ClientSet, KubeClientProvider};
pub use informers::Caches;
pub use versions::{seed_versions, KubeStatusReader, StatusReader};
pub use wiring::{fixed_related_objects, related_objects, wire_controllers, Wired, WiringContext};

use crate::debug::{DebugServer, RESOURCE_SYNC_DEBUG_PATH};
use crate::environment::OperatorEnvironment;
use crate::error::Result;
use crate::orchestrator::Orchestrator;

/// Inputs to the startup sequence
pub struct StartupConfig<'a> {
    /// Builds one client per API group
    pub provider: &'a dyn ClientProvider,
    /// Process environment
    pub environment: OperatorEnvironment,
    /// Ledger to seed and share with the controllers
    pub ledger: Arc<VersionLedger>,
    /// Process log filter
    pub log_level: Arc<dyn LogLevelSetter>,
    /// Workers per controller
    pub workers: usize,
}

/// Build clients, caches and controllers, seeding `config.ledger` on the way.
///
/// `status_reader` is only called once every client exists. When `debug` is
/// given the resource-sync rules are mounted on it.
pub async fn prepare<F, R>(
    config: StartupConfig<'_>,
    status_reader: F,
    debug: Option<&mut DebugServer>,
) -> Result<Orchestrator>
where
    F: FnOnce(&ClientSet) -> R,
    R: StatusReader,
{
    let clients = ClientSet::connect(config.provider).await?;
    let caches = Caches::new(&clients, &config.environment.namespace);

    let reader = status_reader(&clients);
    seed_versions(
        &reader,
        CLUSTER_OPERATOR_NAME,
        &config.ledger,
        &config.environment.operator_image_version,
    )
    .await?;

    let events = Arc::new(KubeEventRecorder::new(
        clients.kubernetes.clone(),
        &config.environment.namespace,
        config.environment.pod_name.as_deref(),
    ));
    let ctx = WiringContext {
        ledger: config.ledger,
        events,
        log_level: config.log_level,
        environment: config.environment,
    };
    let wired = wire_controllers(&clients, &caches, &ctx)?;

    if let Some(debug) = debug {
        debug.handle(RESOURCE_SYNC_DEBUG_PATH, wired.resource_sync.debug_handler());
    }

    info!(
        versions = ctx.ledger.len(),
        controllers = wired.controllers.len(),
        "Startup prepared"
    );
    Ok(Orchestrator::new(
        caches.factories(),
        wired.controllers,
        config.workers,
    ))
}
