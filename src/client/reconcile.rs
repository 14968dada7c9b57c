//! Snapshot Reconciliation
//!
//! Compares each pushed catalog snapshot with the local mount and moves
//! files in whichever direction is newer. Snapshots are applied one at a
//! time; queued ones collapse to the newest.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::connection::StoreClient;
use super::coordinator::TransferOutcome;
use crate::error::{Error, Result, StatusCode};
use crate::protocol::Catalog;

/// Snapshots buffered between the feed and the reconciler
const EVENT_QUEUE: usize = 32;

/// Direction for a file present on the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    None,
    Fetch,
    Store,
}

/// Pick a direction from local and remote mtimes; 0 means absent locally
pub fn decide(local_mtime: u64, remote_mtime: u64) -> SyncAction {
    if local_mtime == remote_mtime {
        SyncAction::None
    } else if local_mtime == 0 || local_mtime < remote_mtime {
        SyncAction::Fetch
    } else {
        SyncAction::Store
    }
}

/// One step of a reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    Fetch { name: String, remote_mtime: u64 },
    Store(String),
    /// Deleted locally since the last pass
    DeleteRemote(String),
    /// Deleted on the server since the last pass
    DeleteLocal(String),
}

impl ReconcileAction {
    pub fn name(&self) -> &str {
        match self {
            ReconcileAction::Fetch { name, .. } => name,
            ReconcileAction::Store(name)
            | ReconcileAction::DeleteRemote(name)
            | ReconcileAction::DeleteLocal(name) => name,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ReconcileAction::Fetch { .. } => "fetch",
            ReconcileAction::Store(_) => "store",
            ReconcileAction::DeleteRemote(_) => "delete-remote",
            ReconcileAction::DeleteLocal(_) => "delete-local",
        }
    }
}

/// Operations the reconciler drives
#[async_trait]
pub trait SyncTarget: Send + Sync {
    async fn fetch(&self, filename: &str) -> Result<TransferOutcome>;
    async fn store(&self, filename: &str) -> Result<TransferOutcome>;
    async fn delete(&self, filename: &str) -> Result<()>;
    /// Local regular files and their mtimes
    async fn local_files(&self) -> Result<HashMap<String, u64>>;
    async fn remove_local(&self, filename: &str) -> Result<()>;
    async fn touch_local(&self, filename: &str, mtime: u64) -> Result<()>;
}

/// Input to the reconcile loop
#[derive(Debug)]
pub enum CallbackEvent {
    Snapshot(Catalog),
    FeedError(Error),
    FeedClosed,
}

/// What one pass did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub fetched: usize,
    pub stored: usize,
    pub deleted_remote: usize,
    pub deleted_local: usize,
    pub failed: Vec<(String, StatusCode)>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.fetched + self.stored + self.deleted_remote + self.deleted_local == 0
            && self.failed.is_empty()
    }
}

pub struct Reconciler<T> {
    target: Arc<T>,
    /// Remote mtimes as of the last applied snapshot
    known: HashMap<String, u64>,
}

impl<T: SyncTarget> Reconciler<T> {
    pub fn new(target: Arc<T>) -> Self {
        Self {
            target,
            known: HashMap::new(),
        }
    }

    pub fn known(&self) -> &HashMap<String, u64> {
        &self.known
    }

    /// Actions needed to bring `local` and `snapshot` together, ordered by name
    pub fn plan(&self, snapshot: &Catalog, local: &HashMap<String, u64>) -> Vec<ReconcileAction> {
        let mut actions = Vec::new();

        for remote in &snapshot.files {
            let local_mtime = local.get(&remote.name).copied().unwrap_or(0);
            let seen_at = self.known.get(&remote.name).copied();

            if local_mtime == 0 && seen_at == Some(remote.last_modified) {
                actions.push(ReconcileAction::DeleteRemote(remote.name.clone()));
                continue;
            }

            match decide(local_mtime, remote.last_modified) {
                SyncAction::None => {}
                SyncAction::Fetch => actions.push(ReconcileAction::Fetch {
                    name: remote.name.clone(),
                    remote_mtime: remote.last_modified,
                }),
                SyncAction::Store => actions.push(ReconcileAction::Store(remote.name.clone())),
            }
        }

        let remote_names: HashSet<&str> = snapshot.files.iter().map(|f| f.name.as_str()).collect();
        for (name, &local_mtime) in local {
            if remote_names.contains(name.as_str()) {
                continue;
            }
            match self.known.get(name) {
                // Edited locally after the server copy went away
                Some(&seen_at) if local_mtime > seen_at => {
                    actions.push(ReconcileAction::Store(name.clone()))
                }
                Some(_) => actions.push(ReconcileAction::DeleteLocal(name.clone())),
                None => actions.push(ReconcileAction::Store(name.clone())),
            }
        }

        actions.sort_by(|a, b| a.name().cmp(b.name()));
        actions
    }

    /// Apply one snapshot
    pub async fn reconcile(&mut self, snapshot: &Catalog) -> Result<ReconcileReport> {
        let local = self.target.local_files().await?;
        let actions = self.plan(snapshot, &local);

        let mut known: HashMap<String, u64> = snapshot
            .files
            .iter()
            .map(|f| (f.name.clone(), f.last_modified))
            .collect();
        let mut report = ReconcileReport::default();

        for action in actions {
            tracing::debug!("Reconcile: {} '{}'", action.kind(), action.name());
            if let Err(e) = self.apply(&action, &mut known, &mut report).await {
                tracing::warn!(
                    "Reconcile {} '{}' failed ({}): {}",
                    action.kind(),
                    action.name(),
                    e.status_code(),
                    e
                );
                report.failed.push((action.name().to_string(), e.status_code()));

                // A failed action leaves the name as it was before this pass
                let name = action.name();
                match self.known.get(name) {
                    Some(&seen_at) => known.insert(name.to_string(), seen_at),
                    None => known.remove(name),
                };
            }
        }

        self.known = known;
        Ok(report)
    }

    async fn apply(
        &self,
        action: &ReconcileAction,
        known: &mut HashMap<String, u64>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        match action {
            ReconcileAction::Fetch { name, remote_mtime } => {
                if let TransferOutcome::AlreadyInSync = self.target.fetch(name).await? {
                    self.target.touch_local(name, *remote_mtime).await?;
                }
                report.fetched += 1;
            }
            ReconcileAction::Store(name) => {
                if let TransferOutcome::Transferred(stored) = self.target.store(name).await? {
                    known.insert(name.clone(), stored.last_modified);
                }
                report.stored += 1;
            }
            ReconcileAction::DeleteRemote(name) => {
                self.target.delete(name).await?;
                known.remove(name);
                report.deleted_remote += 1;
            }
            ReconcileAction::DeleteLocal(name) => {
                self.target.remove_local(name).await?;
                report.deleted_local += 1;
            }
        }
        Ok(())
    }

    /// Reconcile until the feed closes or the sender side goes away
    pub async fn run(mut self, mut events: mpsc::Receiver<CallbackEvent>) {
        while let Some(event) = events.recv().await {
            let (event, closed) = collapse(event, &mut events);
            match event {
                CallbackEvent::Snapshot(snapshot) => match self.reconcile(&snapshot).await {
                    Ok(report) if report.is_noop() => {
                        tracing::trace!("Snapshot of {} files already in sync", snapshot.len())
                    }
                    Ok(report) => tracing::info!(
                        "Reconciled: {} fetched, {} stored, {} deleted remotely, {} deleted locally, {} failed",
                        report.fetched,
                        report.stored,
                        report.deleted_remote,
                        report.deleted_local,
                        report.failed.len()
                    ),
                    Err(e) => tracing::warn!("Skipping snapshot, local scan failed: {}", e),
                },
                CallbackEvent::FeedError(e) => {
                    tracing::warn!("Catalog feed error: {}", e);
                }
                CallbackEvent::FeedClosed => {}
            }

            if closed {
                tracing::info!("Catalog feed closed");
                break;
            }
        }
    }
}

/// Replace a snapshot with the newest one already queued behind it.
/// The flag reports a `FeedClosed` seen on the way.
fn collapse(
    event: CallbackEvent,
    events: &mut mpsc::Receiver<CallbackEvent>,
) -> (CallbackEvent, bool) {
    let mut latest = match event {
        CallbackEvent::Snapshot(snapshot) => snapshot,
        CallbackEvent::FeedClosed => return (CallbackEvent::FeedClosed, true),
        other => return (other, false),
    };

    loop {
        match events.try_recv() {
            Ok(CallbackEvent::Snapshot(newer)) => latest = newer,
            Ok(CallbackEvent::FeedError(e)) => tracing::warn!("Catalog feed error: {}", e),
            Ok(CallbackEvent::FeedClosed) => return (CallbackEvent::Snapshot(latest), true),
            Err(_) => return (CallbackEvent::Snapshot(latest), false),
        }
    }
}

/// Keep a CallbackList subscription open, resubscribing after failures
pub fn spawn_catalog_feed(
    client: StoreClient,
    events: mpsc::Sender<CallbackEvent>,
    retry: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let failure = tokio::select! {
                failure = follow_feed(&client, &events) => failure,
                _ = shutdown.changed() => break,
            };

            match failure {
                Some(e) => {
                    if events.send(CallbackEvent::FeedError(e)).await.is_err() {
                        return;
                    }
                }
                // Receiver dropped
                None => return,
            }

            tokio::select! {
                _ = tokio::time::sleep(retry) => {}
                _ = shutdown.changed() => break,
            }
        }

        let _ = events.send(CallbackEvent::FeedClosed).await;
    })
}

/// Forward snapshots until the subscription fails; `None` if nobody listens
async fn follow_feed(client: &StoreClient, events: &mpsc::Sender<CallbackEvent>) -> Option<Error> {
    let mut subscription = match client.subscribe().await {
        Ok(subscription) => subscription,
        Err(e) => return Some(e),
    };
    tracing::debug!("Subscribed to catalog feed at {}", client.address());

    loop {
        match subscription.next().await {
            Ok(Some(snapshot)) => {
                if events.send(CallbackEvent::Snapshot(snapshot)).await.is_err() {
                    return None;
                }
            }
            Ok(None) => return Some(Error::Network("Catalog feed closed by server".into())),
            Err(e) => return Some(e),
        }
    }
}

/// Start the feed and the reconcile loop for `target`
pub fn spawn_sync<T: SyncTarget + 'static>(
    target: Arc<T>,
    client: StoreClient,
    retry: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE);
    let feed = spawn_catalog_feed(client, tx, retry, shutdown);
    let reconciler = Reconciler::new(target);

    tokio::spawn(async move {
        reconciler.run(rx).await;
        let _ = feed.await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FileMetadata;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTarget {
        local: Mutex<HashMap<String, u64>>,
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        deny_store: bool,
        fail_fetch: bool,
        fail_remove_local: bool,
    }

    impl RecordingTarget {
        fn with_local(files: &[(&str, u64)]) -> Self {
            let target = Self::default();
            {
                let mut local = target.local.lock().unwrap();
                for (name, mtime) in files {
                    local.insert(name.to_string(), *mtime);
                }
            }
            target
        }

        async fn record(&self, call: String) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.calls.lock().unwrap().push(call);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SyncTarget for RecordingTarget {
        async fn fetch(&self, filename: &str) -> Result<TransferOutcome> {
            self.record(format!("fetch {}", filename)).await;
            if self.fail_fetch {
                return Err(Error::DeadlineExceeded);
            }
            Ok(TransferOutcome::AlreadyInSync)
        }

        async fn store(&self, filename: &str) -> Result<TransferOutcome> {
            self.record(format!("store {}", filename)).await;
            if self.deny_store {
                return Err(Error::LockConflict {
                    filename: filename.to_string(),
                    owner: "other".into(),
                });
            }
            let mtime = self.local.lock().unwrap().get(filename).copied().unwrap_or(0);
            Ok(TransferOutcome::Transferred(FileMetadata {
                last_modified: mtime,
                ..FileMetadata::named(filename)
            }))
        }

        async fn delete(&self, filename: &str) -> Result<()> {
            self.record(format!("delete {}", filename)).await;
            Ok(())
        }

        async fn local_files(&self) -> Result<HashMap<String, u64>> {
            Ok(self.local.lock().unwrap().clone())
        }

        async fn remove_local(&self, filename: &str) -> Result<()> {
            self.record(format!("remove-local {}", filename)).await;
            if self.fail_remove_local {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "read-only mount",
                )));
            }
            self.local.lock().unwrap().remove(filename);
            Ok(())
        }

        async fn touch_local(&self, filename: &str, mtime: u64) -> Result<()> {
            self.local.lock().unwrap().insert(filename.to_string(), mtime);
            Ok(())
        }
    }

    fn snapshot(files: &[(&str, u64)]) -> Catalog {
        Catalog {
            files: files
                .iter()
                .map(|(name, mtime)| FileMetadata {
                    last_modified: *mtime,
                    ..FileMetadata::named(*name)
                })
                .collect(),
        }
    }

    #[test]
    fn test_decide() {
        assert_eq!(decide(0, 1000), SyncAction::Fetch);
        assert_eq!(decide(1000, 1000), SyncAction::None);
        assert_eq!(decide(900, 1000), SyncAction::Fetch);
        assert_eq!(decide(1100, 1000), SyncAction::Store);
    }

    #[test]
    fn test_plan_follows_mtimes() {
        let reconciler = Reconciler::new(Arc::new(RecordingTarget::default()));
        let remote = snapshot(&[("a.txt", 1000), ("b.txt", 1000), ("c.txt", 1000), ("d.txt", 1000)]);
        let local: HashMap<String, u64> = [("b.txt", 1000), ("c.txt", 900), ("d.txt", 1100)]
            .iter()
            .map(|(n, m)| (n.to_string(), *m))
            .collect();

        assert_eq!(
            reconciler.plan(&remote, &local),
            vec![
                ReconcileAction::Fetch { name: "a.txt".into(), remote_mtime: 1000 },
                ReconcileAction::Fetch { name: "c.txt".into(), remote_mtime: 1000 },
                ReconcileAction::Store("d.txt".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_deletions_propagate() {
        let target = Arc::new(RecordingTarget::with_local(&[("gone.txt", 1000), ("keep.txt", 1000)]));
        let mut reconciler = Reconciler::new(target.clone());

        let first = reconciler
            .reconcile(&snapshot(&[("gone.txt", 1000), ("keep.txt", 1000), ("mine.txt", 1000)]))
            .await
            .unwrap();
        assert_eq!(first.fetched, 1);
        assert_eq!(reconciler.known().len(), 3);

        // mine.txt deleted locally, gone.txt deleted on the server
        target.local.lock().unwrap().remove("mine.txt");
        let second = reconciler
            .reconcile(&snapshot(&[("keep.txt", 1000), ("mine.txt", 1000)]))
            .await
            .unwrap();

        assert_eq!(second.deleted_local, 1);
        assert_eq!(second.deleted_remote, 1);
        assert!(!target.local.lock().unwrap().contains_key("gone.txt"));
        assert!(target.calls().contains(&"delete mine.txt".to_string()));
        assert!(!reconciler.known().contains_key("mine.txt"));
    }

    #[test]
    fn test_local_edit_survives_remote_delete() {
        let mut reconciler = Reconciler::new(Arc::new(RecordingTarget::default()));
        reconciler.known.insert("notes.txt".into(), 1000);
        reconciler.known.insert("old.txt".into(), 1000);

        let local: HashMap<String, u64> = [("notes.txt", 1200), ("old.txt", 1000), ("new.txt", 50)]
            .iter()
            .map(|(n, m)| (n.to_string(), *m))
            .collect();

        assert_eq!(
            reconciler.plan(&snapshot(&[]), &local),
            vec![
                ReconcileAction::Store("new.txt".into()),
                ReconcileAction::Store("notes.txt".into()),
                ReconcileAction::DeleteLocal("old.txt".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_failures_are_reported() {
        let target = Arc::new(RecordingTarget {
            deny_store: true,
            ..RecordingTarget::with_local(&[("report.txt", 2000)])
        });
        let mut reconciler = Reconciler::new(target);

        let report = reconciler.reconcile(&snapshot(&[("report.txt", 1000)])).await.unwrap();
        assert_eq!(report.stored, 0);
        assert_eq!(
            report.failed,
            vec![("report.txt".to_string(), StatusCode::FailedPrecondition)]
        );
    }

    #[tokio::test]
    async fn test_failed_fetch_never_becomes_remote_delete() {
        let target = Arc::new(RecordingTarget {
            fail_fetch: true,
            ..RecordingTarget::default()
        });
        let mut reconciler = Reconciler::new(target.clone());
        let remote = snapshot(&[("report.txt", 1000)]);

        let first = reconciler.reconcile(&remote).await.unwrap();
        assert_eq!(
            first.failed,
            vec![("report.txt".to_string(), StatusCode::DeadlineExceeded)]
        );
        assert!(!reconciler.known().contains_key("report.txt"));

        let second = reconciler.reconcile(&remote).await.unwrap();
        assert_eq!(second.deleted_remote, 0);
        assert_eq!(second.failed.len(), 1);
        assert_eq!(target.calls(), vec!["fetch report.txt", "fetch report.txt"]);
    }

    #[tokio::test]
    async fn test_failed_local_delete_is_retried_not_restored() {
        let target = Arc::new(RecordingTarget {
            fail_remove_local: true,
            ..RecordingTarget::with_local(&[("gone.txt", 1000)])
        });
        let mut reconciler = Reconciler::new(target.clone());
        reconciler.known.insert("gone.txt".into(), 1000);

        let first = reconciler.reconcile(&snapshot(&[])).await.unwrap();
        assert_eq!(first.failed.len(), 1);
        assert_eq!(reconciler.known().get("gone.txt"), Some(&1000));

        reconciler.reconcile(&snapshot(&[])).await.unwrap();
        assert_eq!(
            target.calls(),
            vec!["remove-local gone.txt", "remove-local gone.txt"]
        );
    }

    #[tokio::test]
    async fn test_run_collapses_queued_snapshots() {
        let target = Arc::new(RecordingTarget::default());
        let reconciler = Reconciler::new(target.clone());
        let (tx, rx) = mpsc::channel(8);

        tx.send(CallbackEvent::Snapshot(snapshot(&[("one.txt", 1)]))).await.unwrap();
        tx.send(CallbackEvent::Snapshot(snapshot(&[("two.txt", 2)]))).await.unwrap();
        tx.send(CallbackEvent::Snapshot(snapshot(&[("three.txt", 3), ("four.txt", 4)])))
            .await
            .unwrap();
        tx.send(CallbackEvent::FeedClosed).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), reconciler.run(rx))
            .await
            .unwrap();

        assert_eq!(target.calls(), vec!["fetch four.txt", "fetch three.txt"]);
        assert_eq!(target.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_survives_feed_errors() {
        let target = Arc::new(RecordingTarget::default());
        let reconciler = Reconciler::new(target.clone());
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(reconciler.run(rx));

        tx.send(CallbackEvent::FeedError(Error::Network("reset".into())))
            .await
            .unwrap();
        tx.send(CallbackEvent::Snapshot(snapshot(&[("a.txt", 5)]))).await.unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(target.calls(), vec!["fetch a.txt"]);
    }
}
