//! Version ledger
//!
//! In-memory map of component name to version, shared by the controller that
//! learns versions (the workload controller) and the controller that publishes
//! them (the cluster-status controller). The ledger is seeded from the last
//! published status before any controller starts so the published versions
//! never regress to empty while the first syncs are still in flight.

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::informer::Watched;

/// Thread-safe component-to-version map with change notification
pub struct VersionLedger {
    versions: RwLock<BTreeMap<String, String>>,
    changes: broadcast::Sender<()>,
}

impl Default for VersionLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(8);
        Self {
            versions: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    /// Record `version` for `component`, overwriting any previous value.
    ///
    /// Subscribers are notified only when the value actually changes.
    pub fn set_version(&self, component: impl Into<String>, version: impl Into<String>) {
        let component = component.into();
        let version = version.into();
        let changed = {
            let mut versions = self.versions.write();
            match versions.get(&component) {
                Some(existing) if *existing == version => false,
                _ => {
                    versions.insert(component, version);
                    true
                }
            }
        };
        if changed {
            let _ = self.changes.send(());
        }
    }

    /// Version recorded for `component`
    pub fn get_version(&self, component: &str) -> Option<String> {
        self.versions.read().get(component).cloned()
    }

    /// Snapshot of every recorded version, ordered by component name
    pub fn versions(&self) -> BTreeMap<String, String> {
        self.versions.read().clone()
    }

    /// Number of recorded components
    pub fn len(&self) -> usize {
        self.versions.read().len()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.versions.read().is_empty()
    }
}

impl Watched for VersionLedger {
    fn kind(&self) -> &str {
        "VersionLedger"
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }

    fn ready(&self) -> BoxFuture<'static, bool> {
        futures::future::ready(true).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn set_and_get() {
        let ledger = VersionLedger::new();
        assert!(ledger.is_empty());
        ledger.set_version("operator", "4.15.0");
        assert_eq!(ledger.get_version("operator").as_deref(), Some("4.15.0"));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn later_value_overwrites() {
        let ledger = VersionLedger::new();
        ledger.set_version("operator", "1.0");
        ledger.set_version("operator", "2.0");
        assert_eq!(ledger.get_version("operator").as_deref(), Some("2.0"));
    }

    #[tokio::test]
    async fn notifies_only_on_change() {
        let ledger = VersionLedger::new();
        let mut rx = ledger.subscribe();

        ledger.set_version("operator", "1.0");
        assert!(rx.try_recv().is_ok());

        ledger.set_version("operator", "1.0");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn is_always_ready() {
        assert!(VersionLedger::new().ready().await);
    }

    #[test]
    fn independent_ledgers_do_not_share_state() {
        let a = VersionLedger::new();
        let b = VersionLedger::new();
        a.set_version("operator", "1.0");
        assert!(b.is_empty());
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let ledger = Arc::new(VersionLedger::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for j in 0..100 {
                        ledger.set_version(format!("component-{}", i), format!("{}", j));
                        let _ = ledger.versions();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ledger.len(), 8);
        assert_eq!(ledger.get_version("component-3").as_deref(), Some("99"));
    }
}
