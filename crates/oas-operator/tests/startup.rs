//! Startup sequence against fake clients and a fake status reader; no
//! cluster is needed because nothing is read before the stop signal

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use oas_common::crd::{ClusterOperator, ClusterOperatorSpec, ClusterOperatorStatus, OperandVersion};
use oas_common::VersionLedger;
use oas_controllers::LogLevelSetter;
use oas_operator::debug::{DebugServer, RESOURCE_SYNC_DEBUG_PATH};
use oas_operator::environment::{OperatorEnvironment, OPERATOR_IMAGE_VERSION_ENV};
use oas_operator::startup::{prepare, ApiGroup, ClientProvider, StartupConfig, StatusReader};
use oas_operator::{run_with_diagnostics, Error, Phase, Stopped};

struct FakeProvider {
    failing: Option<ApiGroup>,
    calls: Mutex<Vec<ApiGroup>>,
}

impl FakeProvider {
    fn healthy() -> Self {
        Self {
            failing: None,
            calls: Mutex::default(),
        }
    }

    fn failing(group: ApiGroup) -> Self {
        Self {
            failing: Some(group),
            calls: Mutex::default(),
        }
    }
}

#[async_trait]
impl ClientProvider for FakeProvider {
    async fn client(&self, group: ApiGroup) -> oas_operator::Result<Client> {
        self.calls.lock().push(group);
        if self.failing == Some(group) {
            return Err(Error::client(
                group,
                oas_common::Error::Config("unreachable".to_string()),
            ));
        }
        let config = kube::Config::new("http://127.0.0.1:9".parse().unwrap());
        Ok(Client::try_from(config).unwrap())
    }
}

struct FakeStatus {
    published: Option<Vec<(&'static str, &'static str)>>,
}

#[async_trait]
impl StatusReader for FakeStatus {
    async fn get(&self, name: &str) -> Result<ClusterOperator, oas_common::Error> {
        let Some(versions) = &self.published else {
            return Err(oas_common::Error::not_found("ClusterOperator", name));
        };
        let mut co = ClusterOperator::new(name, ClusterOperatorSpec::default());
        co.status = Some(ClusterOperatorStatus {
            versions: versions
                .iter()
                .map(|(n, v)| OperandVersion {
                    name: n.to_string(),
                    version: v.to_string(),
                })
                .collect(),
            ..Default::default()
        });
        Ok(co)
    }
}

struct FixedLevel;

impl LogLevelSetter for FixedLevel {
    fn current(&self) -> String {
        "info".to_string()
    }

    fn set(&self, _directives: &str) -> Result<(), oas_common::Error> {
        Ok(())
    }
}

fn environment(version: &str) -> OperatorEnvironment {
    let version = version.to_string();
    OperatorEnvironment::from_lookup(move |key| {
        (key == OPERATOR_IMAGE_VERSION_ENV).then(|| version.clone())
    })
}

fn config<'a>(
    provider: &'a FakeProvider,
    ledger: &Arc<VersionLedger>,
    version: &str,
) -> StartupConfig<'a> {
    StartupConfig {
        provider,
        environment: environment(version),
        ledger: ledger.clone(),
        log_level: Arc::new(FixedLevel),
        workers: 1,
    }
}

fn versions(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn fresh_install_runs_until_stopped() {
    let provider = FakeProvider::healthy();
    let ledger = Arc::new(VersionLedger::new());
    let mut debug = DebugServer::new();

    let orchestrator = prepare(
        config(&provider, &ledger, "9.9.9"),
        |_| FakeStatus { published: None },
        Some(&mut debug),
    )
    .await
    .unwrap();

    assert_eq!(ledger.versions(), versions(&[("operator", "9.9.9")]));
    assert_eq!(orchestrator.controller_names().len(), 7);
    assert!(debug.paths().iter().any(|p| p == RESOURCE_SYNC_DEBUG_PATH));
    assert_eq!(provider.calls.lock().len(), 4);

    let shutdown = CancellationToken::new();
    let mut phase = orchestrator.phase();
    let run = tokio::spawn(orchestrator.run(shutdown.clone()));
    phase
        .wait_for(|p| *p == Phase::ControllersRunning)
        .await
        .unwrap();

    shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(10), run).await;
    assert_eq!(result.unwrap().unwrap(), Stopped);
}

#[tokio::test]
async fn published_versions_are_kept_and_operator_version_overwritten() {
    let provider = FakeProvider::healthy();
    let ledger = Arc::new(VersionLedger::new());

    prepare(
        config(&provider, &ledger, "4.16.0"),
        |_| FakeStatus {
            published: Some(vec![("A", "1.0"), ("B", "2.0"), ("operator", "4.15.0")]),
        },
        None,
    )
    .await
    .unwrap();

    assert_eq!(
        ledger.versions(),
        versions(&[("A", "1.0"), ("B", "2.0"), ("operator", "4.16.0")])
    );
}

#[tokio::test]
async fn failing_client_group_aborts_before_anything_else() {
    for group in ApiGroup::ALL {
        let provider = FakeProvider::failing(group);
        let ledger = Arc::new(VersionLedger::new());
        let mut debug = DebugServer::new();
        let reader_built = AtomicBool::new(false);

        let result = prepare(
            config(&provider, &ledger, "9.9.9"),
            |_| {
                reader_built.store(true, Ordering::SeqCst);
                FakeStatus { published: None }
            },
            Some(&mut debug),
        )
        .await;

        match result {
            Err(Error::ClientConstruction { group: failed, .. }) => assert_eq!(failed, group),
            Err(other) => panic!("unexpected error for {}: {}", group, other),
            Ok(_) => panic!("startup succeeded although {} failed", group),
        }
        assert_eq!(provider.calls.lock().last(), Some(&group));
        assert!(!reader_built.load(Ordering::SeqCst));
        assert!(ledger.is_empty());
        assert_eq!(debug.paths().len(), 1);
    }
}

#[tokio::test]
async fn status_read_failure_aborts_startup() {
    struct Forbidden;

    #[async_trait]
    impl StatusReader for Forbidden {
        async fn get(&self, _name: &str) -> Result<ClusterOperator, oas_common::Error> {
            Err(oas_common::Error::Config("forbidden".to_string()))
        }
    }

    let provider = FakeProvider::healthy();
    let ledger = Arc::new(VersionLedger::new());
    let result = prepare(config(&provider, &ledger, "9.9.9"), |_| Forbidden, None).await;
    assert!(matches!(result, Err(Error::StatusRead { .. })));
    assert!(ledger.is_empty());
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn taken_listen_address_fails_before_anything_runs() {
    let provider = FakeProvider::healthy();
    let ledger = Arc::new(VersionLedger::new());
    let mut debug = DebugServer::new();
    let orchestrator = prepare(
        config(&provider, &ledger, "9.9.9"),
        |_| FakeStatus { published: None },
        Some(&mut debug),
    )
    .await
    .unwrap();

    let holder = DebugServer::new()
        .bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let taken = holder.local_addr().unwrap();

    let result = debug.bind(taken).await;
    assert!(matches!(result, Err(Error::DebugServer(_))));
    assert_eq!(*orchestrator.phase().borrow(), Phase::Unstarted);
}

#[tokio::test]
async fn diagnostics_are_served_and_drained_within_grace() {
    let provider = FakeProvider::healthy();
    let ledger = Arc::new(VersionLedger::new());
    let mut debug = DebugServer::new();
    let orchestrator = prepare(
        config(&provider, &ledger, "9.9.9"),
        |_| FakeStatus { published: None },
        Some(&mut debug),
    )
    .await
    .unwrap()
    .with_shutdown_grace(Duration::from_millis(200));

    let diagnostics = debug.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = diagnostics.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let mut phase = orchestrator.phase();
    let run = tokio::spawn(run_with_diagnostics(
        orchestrator,
        Some(diagnostics),
        shutdown.clone(),
    ));
    phase
        .wait_for(|p| *p == Phase::ControllersRunning)
        .await
        .unwrap();

    let response = http_get(addr, RESOURCE_SYNC_DEBUG_PATH).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("etcd-serving-ca"));

    // A client stuck mid-request must not hold up exit
    let mut stalled = TcpStream::connect(addr).await.unwrap();
    stalled.write_all(b"GET /healthz HTTP/1.1\r\n").await.unwrap();

    shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), run).await;
    assert_eq!(result.unwrap().unwrap(), Stopped);
    drop(stalled);
}
