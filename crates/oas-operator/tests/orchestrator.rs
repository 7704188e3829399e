//! Ordering and shutdown of the startup state machine, driven with fake
//! cache factories and controllers

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use oas_common::CacheFactory;
use oas_controllers::Controller;
use oas_operator::{Orchestrator, Phase, Stopped};

type CallLog = Arc<Mutex<Vec<String>>>;

struct FakeCache {
    name: String,
    log: CallLog,
}

impl CacheFactory for FakeCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, _shutdown: CancellationToken) {
        self.log.lock().push(format!("cache:{}", self.name));
    }
}

struct FakeController {
    name: String,
    log: CallLog,
}

#[async_trait]
impl Controller for FakeController {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, workers: usize, shutdown: CancellationToken) {
        self.log
            .lock()
            .push(format!("controller:{}:{}", self.name, workers));
        shutdown.cancelled().await;
    }
}

fn orchestrator(log: &CallLog, caches: usize, controllers: usize) -> Orchestrator {
    let caches = (0..caches)
        .map(|i| {
            let cache: Arc<dyn CacheFactory> = Arc::new(FakeCache {
                name: format!("c{}", i),
                log: log.clone(),
            });
            cache
        })
        .collect();
    let controllers = (0..controllers)
        .map(|i| {
            let controller: Arc<dyn Controller> = Arc::new(FakeController {
                name: format!("k{}", i),
                log: log.clone(),
            });
            controller
        })
        .collect();
    Orchestrator::new(caches, controllers, 2)
}

async fn wait_for_entries(log: &CallLog, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while log.lock().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("every fake was called");
}

#[tokio::test]
async fn caches_start_before_any_controller_runs() {
    let log: CallLog = Arc::default();
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(orchestrator(&log, 4, 7).run(shutdown.clone()));

    wait_for_entries(&log, 11).await;
    let calls = log.lock().clone();
    let first_controller = calls
        .iter()
        .position(|c| c.starts_with("controller:"))
        .unwrap();
    let last_cache = calls.iter().rposition(|c| c.starts_with("cache:")).unwrap();
    assert!(last_cache < first_controller, "call order: {:?}", calls);
    assert!(calls
        .iter()
        .filter(|c| c.starts_with("controller:"))
        .all(|c| c.ends_with(":2")));

    shutdown.cancel();
    assert_eq!(run.await.unwrap(), Stopped);
}

#[tokio::test]
async fn wait_does_not_return_before_stop() {
    let log: CallLog = Arc::default();
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(orchestrator(&log, 1, 1).run(shutdown.clone()));

    wait_for_entries(&log, 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!run.is_finished());

    shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), run).await;
    assert_eq!(result.unwrap().unwrap(), Stopped);
}

#[tokio::test]
async fn phases_advance_in_order() {
    let log: CallLog = Arc::default();
    let shutdown = CancellationToken::new();
    let orchestrator = orchestrator(&log, 2, 2);
    let mut phase = orchestrator.phase();
    assert_eq!(*phase.borrow(), Phase::Unstarted);

    let run = tokio::spawn(orchestrator.run(shutdown.clone()));
    phase
        .wait_for(|p| *p == Phase::ControllersRunning)
        .await
        .unwrap();

    shutdown.cancel();
    assert_eq!(run.await.unwrap(), Stopped);
    assert_eq!(*phase.borrow(), Phase::Stopped);
}

#[tokio::test]
async fn already_stopped_returns_promptly() {
    let log: CallLog = Arc::default();
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator(&log, 3, 7).run(shutdown),
    )
    .await;
    assert_eq!(result.unwrap(), Stopped);
    // Caches were still started before controllers
    assert!(log.lock().iter().take(3).all(|c| c.starts_with("cache:")));
}
