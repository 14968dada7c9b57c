//! Client Coordinator
//!
//! Store and Delete follow one state machine:
//!
//! ```text
//! Init -> LockRequested -> Locked -> Transferring -> Done
//!                      |                         \-> FailedCede
//!                      \-> LockDenied
//! ```
//!
//! A lock denial is returned unchanged; nothing retries. A server
//! `Internal` failure cedes the lock and reports `Cancelled`. Other
//! failures are returned as-is and the lock stays with this client.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::connection::{unexpected_reply, StoreClient};
use super::reconcile::SyncTarget;
use crate::checksum::file_checksum;
use crate::config::WolfStoreConfig;
use crate::error::{Error, Result, StatusCode};
use crate::protocol::{Catalog, FileMetadata, Reply, Request};
use crate::storage::{is_partial, partial_path, resolve_path, set_mtime, stat_file};

/// Stage of a Store or Delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Init,
    LockRequested,
    Locked,
    Transferring,
    Done,
    FailedCede,
    LockDenied,
}

/// Result of a successful Store or Fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Content moved; metadata as recorded by the receiving side
    Transferred(FileMetadata),
    /// Both sides already held identical content
    AlreadyInSync,
}

/// Tracks one mutating operation through `WriteState`
struct WriteOperation<'a> {
    op: &'static str,
    filename: &'a str,
    state: WriteState,
}

impl<'a> WriteOperation<'a> {
    fn new(op: &'static str, filename: &'a str) -> Self {
        Self {
            op,
            filename,
            state: WriteState::Init,
        }
    }

    fn advance(&mut self, next: WriteState) {
        tracing::debug!("{} '{}': {:?} -> {:?}", self.op, self.filename, self.state, next);
        self.state = next;
    }
}

/// Client-side entry point for all file operations
pub struct ClientNode {
    client: StoreClient,
    mount_path: PathBuf,
    client_id: String,
    chunk_size: usize,
}

impl ClientNode {
    pub fn new(
        client: StoreClient,
        mount_path: PathBuf,
        client_id: impl Into<String>,
        chunk_size: usize,
    ) -> Self {
        Self {
            client,
            mount_path,
            client_id: client_id.into(),
            chunk_size,
        }
    }

    pub fn from_config(config: &WolfStoreConfig) -> Self {
        Self::new(
            StoreClient::from_config(config),
            config.client.mount_path.clone(),
            config.client.client_id.clone(),
            config.transfer.chunk_size,
        )
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    pub fn connection(&self) -> &StoreClient {
        &self.client
    }

    /// Ask the server for the write lock on `filename`
    pub async fn request_write_access(&self, filename: &str) -> Result<()> {
        let request = FileMetadata::lock_request(filename, self.client_id.as_str());
        match self.client.call(Request::GetWriteLock(Some(request))).await {
            Ok(_) => {
                tracing::debug!(
                    "Client {} acquired the write lock for '{}'",
                    self.client_id,
                    filename
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!("Write lock for '{}' denied: {}", filename, e);
                Err(e)
            }
        }
    }

    /// Give the write lock on `filename` back
    pub async fn cede_write_access(&self, filename: &str) -> Result<()> {
        let request = FileMetadata::lock_request(filename, self.client_id.as_str());
        match self.client.call(Request::ReleaseWriteLock(Some(request))).await {
            Ok(_) => {
                tracing::debug!(
                    "Client {} gave up the write lock for '{}'",
                    self.client_id,
                    filename
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to release write lock for '{}': {}", filename, e);
                Err(e)
            }
        }
    }

    /// Upload the local copy of `filename`
    pub async fn store(&self, filename: &str) -> Result<TransferOutcome> {
        let mut op = WriteOperation::new("Store", filename);

        let path = resolve_path(&self.mount_path, filename)?;
        let local = stat_file(&path, filename).await?.ok_or_else(|| {
            tracing::error!("File {:?} does not exist", path);
            Error::NotFound(filename.to_string())
        })?;
        let crc = file_checksum(&path).await?;

        op.advance(WriteState::LockRequested);
        if let Err(e) = self.request_write_access(filename).await {
            op.advance(WriteState::LockDenied);
            return Err(e);
        }
        op.advance(WriteState::Locked);

        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("Failed to open {:?}: {}", path, e);
                op.advance(WriteState::FailedCede);
                let _ = self.cede_write_access(filename).await;
                return Err(Error::Cancelled);
            }
        };

        let metadata = FileMetadata {
            name: filename.to_string(),
            size: local.size,
            last_modified: local.last_modified,
            crc,
            client_id: Some(self.client_id.clone()),
        };

        op.advance(WriteState::Transferring);
        tracing::info!(
            "Uploading file '{}' ({} bytes) with mtime {}",
            filename,
            local.size,
            local.last_modified
        );

        match self.client.upload(metadata, file, self.chunk_size).await {
            Ok(stored) => {
                self.finish_write(&mut op).await;
                Ok(TransferOutcome::Transferred(stored))
            }
            Err(e) if e.status_code() == StatusCode::AlreadyExists => {
                tracing::debug!("Server already holds '{}'", filename);
                self.finish_write(&mut op).await;
                Ok(TransferOutcome::AlreadyInSync)
            }
            Err(e) => Err(self.fail_write(&mut op, e).await),
        }
    }

    /// Download `filename` into the mount directory
    pub async fn fetch(&self, filename: &str) -> Result<TransferOutcome> {
        let path = resolve_path(&self.mount_path, filename)?;
        let request = FileMetadata {
            crc: file_checksum(&path).await?,
            ..FileMetadata::named(filename)
        };

        tokio::fs::create_dir_all(&self.mount_path).await?;
        let partial = partial_path(&self.mount_path, filename)?;
        let mut file = tokio::fs::File::create(&partial).await.map_err(|e| {
            tracing::error!("Failed to open {:?} for writing: {}", partial, e);
            Error::Cancelled
        })?;

        let received = self.client.download(request, &mut file).await;
        drop(file);

        let remote = match received {
            Ok(remote) => remote,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return match e.status_code() {
                    StatusCode::AlreadyExists => {
                        tracing::debug!("Local copy of '{}' is current", filename);
                        Ok(TransferOutcome::AlreadyInSync)
                    }
                    _ => {
                        tracing::error!("Download of '{}' failed: {}", filename, e);
                        Err(remap_internal(e))
                    }
                };
            }
        };

        if let Err(e) = tokio::fs::rename(&partial, &path).await {
            tracing::error!("Failed to move download into place at {:?}: {}", path, e);
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(Error::Cancelled);
        }
        set_mtime(&path, remote.last_modified)?;

        tracing::info!(
            "Fetched file '{}' ({} bytes, mtime {})",
            filename,
            remote.size,
            remote.last_modified
        );
        Ok(TransferOutcome::Transferred(remote))
    }

    /// Delete `filename` on the server
    pub async fn delete(&self, filename: &str) -> Result<()> {
        let mut op = WriteOperation::new("Delete", filename);

        op.advance(WriteState::LockRequested);
        if let Err(e) = self.request_write_access(filename).await {
            op.advance(WriteState::LockDenied);
            return Err(e);
        }
        op.advance(WriteState::Locked);

        op.advance(WriteState::Transferring);
        match self
            .client
            .call(Request::RemoveFile(Some(FileMetadata::named(filename))))
            .await
        {
            Ok(_) => {
                self.finish_write(&mut op).await;
                tracing::info!("Deleted '{}' on the server", filename);
                Ok(())
            }
            Err(e) => Err(self.fail_write(&mut op, e).await),
        }
    }

    /// List the server's catalog
    pub async fn list(&self) -> Result<Catalog> {
        match self.client.call(Request::ListFiles).await {
            Ok(Reply::Catalog(catalog)) => Ok(catalog),
            Ok(other) => Err(unexpected_reply(&other)),
            Err(e) => {
                tracing::error!("Listing files failed: {}", e);
                Err(remap_internal(e))
            }
        }
    }

    /// Status of one file on the server
    pub async fn stat(&self, filename: &str) -> Result<FileMetadata> {
        match self
            .client
            .call(Request::GetFileStatus(Some(FileMetadata::named(filename))))
            .await
        {
            Ok(Reply::Context(metadata)) => Ok(metadata),
            Ok(other) => Err(unexpected_reply(&other)),
            Err(e) => {
                tracing::error!("GetFileStatus for '{}' failed: {}", filename, e);
                Err(remap_internal(e))
            }
        }
    }

    /// Regular files in the local mount with their mtimes
    pub async fn local_files(&self) -> Result<HashMap<String, u64>> {
        let mut files = HashMap::new();
        let mut entries = match tokio::fs::read_dir(&self.mount_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_partial(&name) {
                continue;
            }
            if let Some(meta) = stat_file(&entry.path(), &name).await? {
                files.insert(name, meta.last_modified);
            }
        }
        Ok(files)
    }

    /// Successful end of a write: release the lock
    async fn finish_write(&self, op: &mut WriteOperation<'_>) {
        op.advance(WriteState::Done);
        if let Err(e) = self.cede_write_access(op.filename).await {
            tracing::warn!("{} of '{}' succeeded but the lock was not released: {}", op.op, op.filename, e);
        }
    }

    /// Failed write: cede on Internal, otherwise keep the lock
    async fn fail_write(&self, op: &mut WriteOperation<'_>, e: Error) -> Error {
        tracing::error!("{} of '{}' failed: {}", op.op, op.filename, e);

        if e.status_code() == StatusCode::Internal {
            op.advance(WriteState::FailedCede);
            let _ = self.cede_write_access(op.filename).await;
            return Error::Cancelled;
        }

        tracing::warn!(
            "Write lock for '{}' is still held by {} after {}",
            op.filename,
            self.client_id,
            e.status_code()
        );
        e
    }
}

/// Report any Internal failure as Cancelled
fn remap_internal(e: Error) -> Error {
    if e.status_code() == StatusCode::Internal {
        Error::Cancelled
    } else {
        e
    }
}

#[async_trait]
impl SyncTarget for ClientNode {
    async fn fetch(&self, filename: &str) -> Result<TransferOutcome> {
        ClientNode::fetch(self, filename).await
    }

    async fn store(&self, filename: &str) -> Result<TransferOutcome> {
        ClientNode::store(self, filename).await
    }

    async fn delete(&self, filename: &str) -> Result<()> {
        ClientNode::delete(self, filename).await
    }

    async fn local_files(&self) -> Result<HashMap<String, u64>> {
        ClientNode::local_files(self).await
    }

    async fn remove_local(&self, filename: &str) -> Result<()> {
        let path = resolve_path(&self.mount_path, filename)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!("Removed local copy of '{}'", filename);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn touch_local(&self, filename: &str, mtime: u64) -> Result<()> {
        let path = resolve_path(&self.mount_path, filename)?;
        set_mtime(&path, mtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum;
    use crate::server::{LockManager, ShutdownHandle, StoreServer};
    use std::sync::Arc;
    use std::time::Duration;

    struct Cluster {
        server_dir: tempfile::TempDir,
        addr: String,
        locks: Arc<LockManager>,
        handle: ShutdownHandle,
    }

    impl Drop for Cluster {
        fn drop(&mut self) {
            self.handle.stop();
        }
    }

    async fn cluster() -> Cluster {
        let server_dir = tempfile::tempdir().unwrap();
        let mut config = WolfStoreConfig::default();
        config.server.bind_address = "127.0.0.1:0".into();
        config.server.mount_path = server_dir.path().to_path_buf();
        config.server.callback_interval_ms = 0;
        config.transfer.chunk_size = 4096;

        let server = StoreServer::bind(&config).await.unwrap();
        let addr = server.local_addr().to_string();
        let locks = server.locks();
        let handle = server.shutdown_handle();
        tokio::spawn(server.run());

        Cluster {
            server_dir,
            addr,
            locks,
            handle,
        }
    }

    fn node(cluster: &Cluster, mount: &Path, client_id: &str) -> ClientNode {
        let client = StoreClient::new(
            cluster.addr.clone(),
            Duration::from_secs(2),
            Duration::from_secs(5),
        );
        ClientNode::new(client, mount.to_path_buf(), client_id, 4096)
    }

    #[tokio::test]
    async fn test_store_then_fetch_round_trip() {
        let cluster = cluster().await;
        let mount_a = tempfile::tempdir().unwrap();
        let mount_b = tempfile::tempdir().unwrap();
        let a = node(&cluster, mount_a.path(), "A");
        let b = node(&cluster, mount_b.path(), "B");

        let data: Vec<u8> = (0..50_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let local = mount_a.path().join("report.txt");
        std::fs::write(&local, &data).unwrap();
        set_mtime(&local, 1_620_000_000).unwrap();

        let stored = match a.store("report.txt").await.unwrap() {
            TransferOutcome::Transferred(meta) => meta,
            other => panic!("Unexpected outcome {:?}", other),
        };
        assert_eq!(stored.crc, Some(checksum(&data)));
        assert_eq!(cluster.locks.held_count().await, 0);

        let fetched = match b.fetch("report.txt").await.unwrap() {
            TransferOutcome::Transferred(meta) => meta,
            other => panic!("Unexpected outcome {:?}", other),
        };
        let copy = std::fs::read(mount_b.path().join("report.txt")).unwrap();
        assert_eq!(copy, data);
        assert_eq!(checksum(&copy), stored.crc.unwrap());
        assert_eq!(fetched.last_modified, 1_620_000_000);

        let local_b = stat_file(&mount_b.path().join("report.txt"), "report.txt")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(local_b.last_modified, 1_620_000_000);

        // Same content on both sides now
        assert_eq!(b.fetch("report.txt").await.unwrap(), TransferOutcome::AlreadyInSync);
    }

    #[tokio::test]
    async fn test_store_missing_local_file() {
        let cluster = cluster().await;
        let mount = tempfile::tempdir().unwrap();
        let a = node(&cluster, mount.path(), "A");

        let err = a.store("nope.txt").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NotFound);
        assert_eq!(cluster.locks.held_count().await, 0);
    }

    #[tokio::test]
    async fn test_store_denied_while_other_client_holds_lock() {
        let cluster = cluster().await;
        let mount = tempfile::tempdir().unwrap();
        let a = node(&cluster, mount.path(), "A");
        std::fs::write(mount.path().join("shared.bin"), b"from A").unwrap();

        cluster.locks.acquire("shared.bin", "B").await.unwrap();
        let err = a.store("shared.bin").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FailedPrecondition);
        assert!(!cluster.server_dir.path().join("shared.bin").exists());
        assert_eq!(cluster.locks.owner("shared.bin").await.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_internal_failure_cedes_lock() {
        let cluster = cluster().await;
        let blocker = cluster.server_dir.path().join("report.txt");
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("inner"), b"x").unwrap();

        let mount = tempfile::tempdir().unwrap();
        let a = node(&cluster, mount.path(), "A");
        std::fs::write(mount.path().join("report.txt"), b"content").unwrap();

        let err = a.store("report.txt").await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(cluster.locks.owner("report.txt").await, None);
    }

    #[tokio::test]
    async fn test_stale_large_upload_rejected() {
        let cluster = cluster().await;
        let server_copy: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        let server_path = cluster.server_dir.path().join("video.bin");
        std::fs::write(&server_path, &server_copy).unwrap();
        set_mtime(&server_path, 1_620_000_100).unwrap();

        // Older and different, large enough that the server answers long before the stream ends
        let mount = tempfile::tempdir().unwrap();
        let a = node(&cluster, mount.path(), "A");
        let local: Vec<u8> = (0..5 * 1024 * 1024u32).map(|i| (i % 13) as u8).collect();
        let local_path = mount.path().join("video.bin");
        std::fs::write(&local_path, &local).unwrap();
        set_mtime(&local_path, 1_620_000_000).unwrap();

        let err = a.store("video.bin").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FailedPrecondition);
        assert_eq!(std::fs::read(&server_path).unwrap(), server_copy);
        assert_eq!(cluster.locks.owner("video.bin").await.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_concurrent_lock_race() {
        let cluster = cluster().await;
        let mount = tempfile::tempdir().unwrap();
        let a = node(&cluster, mount.path(), "A");
        let b = node(&cluster, mount.path(), "B");

        let (ra, rb) = tokio::join!(
            a.request_write_access("shared.bin"),
            b.request_write_access("shared.bin")
        );
        assert!(ra.is_ok() ^ rb.is_ok());

        let (winner, loser, loser_result) = if ra.is_ok() { (&a, &b, rb) } else { (&b, &a, ra) };
        assert_eq!(
            loser_result.unwrap_err().status_code(),
            StatusCode::FailedPrecondition
        );

        winner.cede_write_access("shared.bin").await.unwrap();
        loser.request_write_access("shared.bin").await.unwrap();
        assert_eq!(
            cluster.locks.owner("shared.bin").await.as_deref(),
            Some(loser.client_id())
        );
    }

    #[tokio::test]
    async fn test_release_without_lock() {
        let cluster = cluster().await;
        let mount = tempfile::tempdir().unwrap();
        let a = node(&cluster, mount.path(), "A");

        let err = a.cede_write_access("report.txt").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FailedPrecondition);
        assert_eq!(cluster.locks.held_count().await, 0);
    }

    #[tokio::test]
    async fn test_delete() {
        let cluster = cluster().await;
        let mount = tempfile::tempdir().unwrap();
        let a = node(&cluster, mount.path(), "A");
        std::fs::write(cluster.server_dir.path().join("old.txt"), b"old").unwrap();

        a.delete("old.txt").await.unwrap();
        assert!(!cluster.server_dir.path().join("old.txt").exists());
        assert_eq!(cluster.locks.held_count().await, 0);
    }

    #[tokio::test]
    async fn test_delete_missing_keeps_lock() {
        let cluster = cluster().await;
        let mount = tempfile::tempdir().unwrap();
        let a = node(&cluster, mount.path(), "A");

        let err = a.delete("ghost.txt").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NotFound);
        // Only Internal failures cede
        assert_eq!(cluster.locks.owner("ghost.txt").await.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_list_and_stat() {
        let cluster = cluster().await;
        let server = cluster.server_dir.path();
        std::fs::write(server.join("a.txt"), vec![b'a'; 10]).unwrap();
        set_mtime(&server.join("a.txt"), 1_620_000_000).unwrap();
        std::fs::write(server.join("b.txt"), vec![b'b'; 20]).unwrap();
        set_mtime(&server.join("b.txt"), 1_620_000_100).unwrap();

        let mount = tempfile::tempdir().unwrap();
        let a = node(&cluster, mount.path(), "A");

        let catalog = a.list().await.unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("a.txt").unwrap().last_modified, 1_620_000_000);
        assert_eq!(catalog.get("b.txt").unwrap().size, 20);

        let meta = a.stat("b.txt").await.unwrap();
        assert_eq!(meta.last_modified, 1_620_000_100);

        let err = a.stat("c.txt").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn test_fetch_missing_leaves_no_partial() {
        let cluster = cluster().await;
        let mount = tempfile::tempdir().unwrap();
        let a = node(&cluster, mount.path(), "A");

        let err = a.fetch("missing.txt").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NotFound);
        assert!(a.local_files().await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(mount.path()).unwrap().count(), 0);
    }
}
