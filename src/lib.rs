//! WolfStore - Distributed File Store
//!
//! A server exposes one mounted directory to many clients over a framed
//! TCP protocol. Clients store, fetch, list, stat and delete files.
//!
//! # Architecture
//!
//! Mutations are serialized per file through server-held write locks that
//! clients take before a Store or Delete and give back afterwards. The
//! server pushes catalog snapshots to subscribed clients, which reconcile
//! their local mount by comparing modification times.
//!
//! # Features
//!
//! - Chunked streaming upload/download with CRC32 verification
//! - Atomic writes through partial files renamed into place
//! - Per-file write locks with owner tracking
//! - Catalog change feed with client-side reconciliation
//! - Per-call deadlines

pub mod checksum;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod storage;

pub use config::WolfStoreConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::client::{ClientNode, Reconciler, StoreClient, TransferOutcome};
    pub use crate::config::WolfStoreConfig;
    pub use crate::error::{Error, Result, Status, StatusCode};
    pub use crate::protocol::{Catalog, FileMetadata, Message, Request};
    pub use crate::server::{LockManager, StoreServer};
}
