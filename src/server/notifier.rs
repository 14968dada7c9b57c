//! Catalog Change Publisher
//!
//! Runs apart from the request handlers. Handlers report changes through a
//! `ChangeNotifier`; the publisher turns them into catalog snapshots and
//! broadcasts those to every `CallbackList` subscriber.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};

use super::catalog::CatalogService;
use crate::protocol::Catalog;

/// Pending change notifications before new ones are folded into the queued rescan
const EVENT_QUEUE: usize = 64;
/// Snapshots a subscriber may fall behind before it skips to the newest
const SNAPSHOT_BACKLOG: usize = 16;

/// Reason a snapshot is published
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEvent {
    /// A file was written through UploadFile
    FileStored(String),
    /// A file was deleted through RemoveFile
    FileRemoved(String),
    /// Periodic or externally requested rescan
    Rescan,
}

/// Handle the request handlers use to report catalog changes
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: mpsc::Sender<CatalogEvent>,
}

impl ChangeNotifier {
    /// Report a change; never blocks the caller
    pub fn notify(&self, event: CatalogEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            // A full queue already guarantees a fresh snapshot
            Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::trace!("Catalog publisher stopped, dropping {:?}", event);
            }
        }
    }
}

/// Subscription point for catalog snapshots
#[derive(Debug, Clone)]
pub struct SnapshotFeed {
    tx: broadcast::Sender<Arc<Catalog>>,
}

impl SnapshotFeed {
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Catalog>> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Background task producing catalog snapshots
pub struct CatalogPublisher {
    catalog: Arc<CatalogService>,
    events: mpsc::Receiver<CatalogEvent>,
    feed: SnapshotFeed,
    interval: Option<Duration>,
}

impl CatalogPublisher {
    /// Create the publisher together with its notifier and feed handles
    pub fn new(
        catalog: Arc<CatalogService>,
        interval: Option<Duration>,
    ) -> (Self, ChangeNotifier, SnapshotFeed) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (snapshot_tx, _) = broadcast::channel(SNAPSHOT_BACKLOG);
        let feed = SnapshotFeed { tx: snapshot_tx };

        let publisher = Self {
            catalog,
            events: event_rx,
            feed: feed.clone(),
            interval,
        };
        (publisher, ChangeNotifier { tx: event_tx }, feed)
    }

    /// Publish snapshots until shutdown or until every notifier is dropped
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = self.interval.map(|period| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            let event = tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = next_tick(&mut ticker) => CatalogEvent::Rescan,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            // Fold everything already queued into one snapshot
            let mut coalesced = 0usize;
            while self.events.try_recv().is_ok() {
                coalesced += 1;
            }

            tracing::trace!("Publishing catalog after {:?} (+{} queued)", event, coalesced);
            self.publish().await;
        }

        tracing::debug!("Catalog publisher stopped");
    }

    async fn publish(&self) {
        if self.feed.subscriber_count() == 0 {
            return;
        }

        match self.catalog.list().await {
            Ok(catalog) => {
                let _ = self.feed.tx.send(Arc::new(catalog));
            }
            Err(e) => tracing::warn!("Failed to list catalog for subscribers: {}", e),
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
