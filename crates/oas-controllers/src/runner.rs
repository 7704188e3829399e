//! Controller runner
//!
//! Every controller in this operator reconciles one singleton (the operator
//! configuration, the target namespace, the published status record), so the
//! work queue holds a single key. Changes to any watched cache mark the key
//! dirty; workers take turns draining it. At most one sync is in flight at a
//! time regardless of the worker count, and repeated changes during a sync
//! coalesce into one follow-up sync.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oas_common::informer::Watched;
use oas_common::retry::{jittered, RetryConfig};
use oas_common::Error;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A unit the orchestrator can start and forget
#[async_trait]
pub trait Controller: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Run reconciliation with `workers` workers until `shutdown` fires
    async fn run(&self, workers: usize, shutdown: CancellationToken);
}

/// The sync half of a controller: one pass of observe-and-correct
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Name used in logs and conditions
    fn name(&self) -> &str;

    /// Compare observed with desired state and issue corrective writes
    async fn sync(&self) -> Result<(), Error>;
}

/// Single-key, deduplicating, single-flight work queue
struct WorkQueue {
    dirty: AtomicBool,
    wake: Notify,
    in_flight: Mutex<()>,
    failures: AtomicU32,
}

impl WorkQueue {
    fn new() -> Self {
        Self {
            dirty: AtomicBool::new(false),
            wake: Notify::new(),
            in_flight: Mutex::new(()),
            failures: AtomicU32::new(0),
        }
    }

    fn add(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn take(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }
}

/// A [`Controller`] driving a [`Reconciler`] from cache notifications,
/// periodic resync, and error backoff
pub struct QueueController<R: Reconciler> {
    reconciler: Arc<R>,
    watches: Vec<Arc<dyn Watched>>,
    resync: Option<Duration>,
    backoff: RetryConfig,
}

impl<R: Reconciler> QueueController<R> {
    /// Wrap `reconciler` with no watches and no periodic resync
    pub fn new(reconciler: R) -> Self {
        Self::from_arc(Arc::new(reconciler))
    }

    /// Wrap a shared reconciler
    pub fn from_arc(reconciler: Arc<R>) -> Self {
        Self {
            reconciler,
            watches: Vec::new(),
            resync: None,
            backoff: RetryConfig::controller_requeue(),
        }
    }

    /// Sync whenever `source` changes; also wait for it before the first sync
    pub fn watching(mut self, source: impl Watched + 'static) -> Self {
        self.watches.push(Arc::new(source));
        self
    }

    /// Sync whenever a shared `source` changes
    pub fn watching_shared(mut self, source: Arc<dyn Watched>) -> Self {
        self.watches.push(source);
        self
    }

    /// Sync at least once every `period`
    pub fn resync_every(mut self, period: Duration) -> Self {
        self.resync = Some(period);
        self
    }

    /// Override the requeue backoff after failed syncs
    pub fn with_backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// The wrapped reconciler
    pub fn reconciler(&self) -> &Arc<R> {
        &self.reconciler
    }
}

#[async_trait]
impl<R: Reconciler> Controller for QueueController<R> {
    fn name(&self) -> &str {
        self.reconciler.name()
    }

    async fn run(&self, workers: usize, shutdown: CancellationToken) {
        let name = self.reconciler.name().to_string();
        info!(controller = %name, workers, watches = self.watches.len(), "Starting controller");

        // Subscribe before waiting so nothing that lands during the initial
        // list is missed
        let receivers: Vec<_> = self
            .watches
            .iter()
            .map(|w| (w.kind().to_string(), w.subscribe()))
            .collect();

        let ready = futures::future::join_all(self.watches.iter().map(|w| w.ready()));
        let synced = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(controller = %name, "Stopped before caches synced");
                return;
            }
            results = ready => results.into_iter().all(|ok| ok),
        };
        if !synced {
            error!(controller = %name, "Caches never synced, controller not running");
            shutdown.cancelled().await;
            return;
        }
        debug!(controller = %name, "Caches synced");

        let queue = Arc::new(WorkQueue::new());
        queue.add();

        let mut tasks = JoinSet::new();
        for (kind, rx) in receivers {
            tasks.spawn(forward_changes(
                name.clone(),
                kind,
                rx,
                Arc::clone(&queue),
                shutdown.clone(),
            ));
        }
        if let Some(period) = self.resync {
            tasks.spawn(resync_loop(period, Arc::clone(&queue), shutdown.clone()));
        }
        for _ in 0..workers.max(1) {
            tasks.spawn(worker_loop(
                Arc::clone(&self.reconciler),
                Arc::clone(&queue),
                self.backoff.clone(),
                shutdown.clone(),
            ));
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(controller = %name, error = %e, "Controller task panicked");
                }
            }
        }
        info!(controller = %name, "Controller stopped");
    }
}

async fn forward_changes(
    controller: String,
    kind: String,
    mut rx: broadcast::Receiver<()>,
    queue: Arc<WorkQueue>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            msg = rx.recv() => match msg {
                Ok(()) => queue.add(),
                Err(broadcast::error::RecvError::Lagged(_)) => queue.add(),
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(controller = %controller, kind = %kind, "Change source closed");
                    return;
                }
            }
        }
    }
}

async fn resync_loop(period: Duration, queue: Arc<WorkQueue>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => queue.add(),
        }
    }
}

async fn worker_loop<R: Reconciler>(
    reconciler: Arc<R>,
    queue: Arc<WorkQueue>,
    backoff: RetryConfig,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = queue.wake.notified() => {}
        }

        let retry_after = {
            let _guard = queue.in_flight.lock().await;
            if shutdown.is_cancelled() {
                return;
            }
            if !queue.take() {
                continue;
            }

            match reconciler.sync().await {
                Ok(()) => {
                    queue.failures.store(0, Ordering::SeqCst);
                    debug!(controller = %reconciler.name(), "Sync completed");
                    None
                }
                Err(e) => {
                    let failures = queue.failures.fetch_add(1, Ordering::SeqCst) + 1;
                    let delay = jittered(backoff.delay_for(failures));
                    warn!(
                        controller = %reconciler.name(),
                        error = %e,
                        failures,
                        retry_ms = delay.as_millis(),
                        "Sync failed, requeueing"
                    );
                    Some(delay)
                }
            }
        };

        if let Some(delay) = retry_after {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => queue.add(),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Test doubles shared by the controller tests

    use super::*;
    use futures::future::BoxFuture;
    use futures::FutureExt;

    /// A change source whose readiness and notifications are driven by the test
    #[derive(Clone)]
    pub struct FakeSource {
        pub changes: broadcast::Sender<()>,
        pub ready: bool,
    }

    impl FakeSource {
        pub fn new(ready: bool) -> Self {
            let (changes, _) = broadcast::channel(16);
            Self { changes, ready }
        }
    }

    impl Watched for FakeSource {
        fn kind(&self) -> &str {
            "Fake"
        }

        fn subscribe(&self) -> broadcast::Receiver<()> {
            self.changes.subscribe()
        }

        fn ready(&self) -> BoxFuture<'static, bool> {
            let ready = self.ready;
            async move {
                if ready {
                    true
                } else {
                    futures::future::pending::<bool>().await
                }
            }
            .boxed()
        }
    }
}
