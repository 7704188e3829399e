//! OpenShift API server operator - startup orchestration
//!
//! Brings the operator up in a fixed order:
//!
//! 1. **Clients**: one typed client per API group ([`startup::ClientSet`])
//! 2. **Caches**: one unstarted watch-cache factory per group
//! 3. **Versions**: the version ledger is seeded from the published
//!    ClusterOperator so status never regresses while controllers warm up
//! 4. **Wiring**: the seven controllers are constructed
//! 5. **Run**: caches are started, then controllers, then the
//!    [`Orchestrator`] waits for the stop signal
//!
//! A fault in steps 1-4, or a diagnostic address that cannot be bound, is
//! returned as an [`Error`] before anything runs; a clean stop is reported
//! as [`Stopped`].

pub mod debug;
pub mod environment;
pub mod error;
pub mod orchestrator;
pub mod resource_graph;
pub mod startup;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use oas_common::VersionLedger;
use oas_controllers::LogLevelSetter;

pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, Phase, Stopped};

use debug::{BoundDebugServer, DebugServer};
use environment::OperatorEnvironment;
use startup::{prepare, KubeClientProvider, KubeStatusReader, StartupConfig};

/// Process-level options for one operator run
pub struct OperatorOptions {
    /// Connection descriptor
    pub kube_config: kube::Config,
    /// Process environment
    pub environment: OperatorEnvironment,
    /// Process log filter
    pub log_level: Arc<dyn LogLevelSetter>,
    /// Address for the diagnostic surface, if any
    pub listen: Option<SocketAddr>,
    /// Workers per controller
    pub workers: usize,
}

/// Run the operator until `shutdown` fires
pub async fn run_operator(options: OperatorOptions, shutdown: CancellationToken) -> Result<Stopped> {
    let provider = KubeClientProvider::new(options.kube_config);
    let mut debug = options.listen.map(|_| DebugServer::new());

    let orchestrator = prepare(
        StartupConfig {
            provider: &provider,
            environment: options.environment,
            ledger: Arc::new(VersionLedger::new()),
            log_level: options.log_level,
            workers: options.workers,
        },
        |clients| KubeStatusReader::new(clients.config.clone()),
        debug.as_mut(),
    )
    .await?;

    let diagnostics = match (debug, options.listen) {
        (Some(server), Some(addr)) => Some(server.bind(addr).await?),
        _ => None,
    };

    Ok(run_with_diagnostics(orchestrator, diagnostics, shutdown).await)
}

/// Serve `diagnostics` alongside `orchestrator` until `shutdown` fires.
///
/// The diagnostic surface gets the same drain bound as the controllers.
pub async fn run_with_diagnostics(
    orchestrator: Orchestrator,
    diagnostics: Option<BoundDebugServer>,
    shutdown: CancellationToken,
) -> Stopped {
    let grace = orchestrator.shutdown_grace();
    let server = diagnostics.map(|server| tokio::spawn(server.serve(shutdown.clone())));

    let stopped = orchestrator.run(shutdown).await;

    if let Some(mut server) = server {
        match tokio::time::timeout(grace, &mut server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(error = %e, "Debug server failed"),
            Ok(Err(e)) => warn!(error = %e, "Debug server task panicked"),
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "Debug server did not drain in time, aborting");
                server.abort();
            }
        }
    }
    stopped
}
