//! WolfStore client
//!
//! `StoreClient` speaks the wire protocol, `ClientNode` layers the
//! write-lock state machine on top, and `Reconciler` keeps a local mount
//! in step with the server's catalog feed.

pub mod connection;
pub mod coordinator;
pub mod reconcile;

pub use connection::{CatalogSubscription, StoreClient};
pub use coordinator::{ClientNode, TransferOutcome, WriteState};
pub use reconcile::{
    decide, spawn_catalog_feed, spawn_sync, CallbackEvent, ReconcileAction, ReconcileReport,
    Reconciler, SyncAction, SyncTarget,
};
