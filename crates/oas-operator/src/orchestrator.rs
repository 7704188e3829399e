//! Startup state machine
//!
//! `Unstarted → CachesStarting → ControllersRunning → Stopping → Stopped`.
//! Every cache factory is started before any controller runs. Once the
//! controllers are running the orchestrator only waits for the stop signal;
//! controller failures stay inside each controller's own queue.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use oas_common::CacheFactory;
use oas_controllers::Controller;

/// How long controllers get to exit after the stop signal
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Where the startup sequence is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Constructed, nothing started
    Unstarted,
    /// Cache factories are being started
    CachesStarting,
    /// Every controller has been handed to the runtime
    ControllersRunning,
    /// Stop signal observed, waiting for controllers to exit
    Stopping,
    /// Run finished
    Stopped,
}

/// Outcome of a run that ended because it was told to stop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stopped;

impl fmt::Display for Stopped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operator stopped")
    }
}

impl std::error::Error for Stopped {}

/// Starts caches, then controllers, then waits for the stop signal
pub struct Orchestrator {
    caches: Vec<Arc<dyn CacheFactory>>,
    controllers: Vec<Arc<dyn Controller>>,
    workers: usize,
    shutdown_grace: Duration,
    phase: watch::Sender<Phase>,
}

impl Orchestrator {
    /// Create an orchestrator running each controller with `workers` workers
    pub fn new(
        caches: Vec<Arc<dyn CacheFactory>>,
        controllers: Vec<Arc<dyn Controller>>,
        workers: usize,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Unstarted);
        Self {
            caches,
            controllers,
            workers: workers.max(1),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            phase,
        }
    }

    /// Override how long controllers get to exit after the stop signal
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Time given to controllers after the stop signal
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    /// Observe phase transitions
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Names of the controllers that will be run
    pub fn controller_names(&self) -> Vec<String> {
        self.controllers.iter().map(|c| c.name().to_string()).collect()
    }

    /// Run until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Stopped {
        let Self {
            caches,
            controllers,
            workers,
            shutdown_grace,
            phase,
        } = self;

        phase.send_replace(Phase::CachesStarting);
        for cache in &caches {
            debug!(factory = %cache.name(), "Starting cache factory");
            cache.start(shutdown.clone());
        }

        let mut tasks = JoinSet::new();
        for controller in controllers {
            let token = shutdown.clone();
            tasks.spawn(async move {
                controller.run(workers, token).await;
                controller.name().to_string()
            });
        }
        phase.send_replace(Phase::ControllersRunning);
        info!(caches = caches.len(), controllers = tasks.len(), workers, "Operator running");

        shutdown.cancelled().await;
        phase.send_replace(Phase::Stopping);
        info!("Stop signal received, waiting for controllers");

        let drained = tokio::time::timeout(shutdown_grace, async {
            while let Some(result) = tasks.join_next().await {
                match result {
                    Ok(name) => debug!(controller = %name, "Controller stopped"),
                    Err(e) => warn!(error = %e, "Controller task failed"),
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "Controllers did not stop in time, aborting");
            tasks.abort_all();
        }

        phase.send_replace(Phase::Stopped);
        info!("Operator stopped");
        Stopped
    }
}
