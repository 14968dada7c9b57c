//! File Service
//!
//! UploadFile, DownloadFile and RemoveFile handlers. Deadlines are checked
//! once, on entry; a transfer that is already running is not interrupted.

use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use super::catalog::CatalogService;
use super::notifier::{CatalogEvent, ChangeNotifier};
use super::CallContext;
use crate::checksum::file_checksum;
use crate::error::{Error, Result};
use crate::protocol::transfer::discard_stream;
use crate::protocol::{FileMetadata, TransferReceiver, TransferSender};
use crate::storage::{partial_path, resolve_path, set_mtime, stat_file};

/// Streams files in and out of the mount directory
pub struct FileService {
    catalog: Arc<CatalogService>,
    notifier: ChangeNotifier,
    chunk_size: usize,
}

impl FileService {
    pub fn new(catalog: Arc<CatalogService>, notifier: ChangeNotifier, chunk_size: usize) -> Self {
        Self {
            catalog,
            notifier,
            chunk_size,
        }
    }

    fn mount_path(&self) -> &Path {
        self.catalog.mount_path()
    }

    /// Receive a client stream and store it
    pub async fn upload<R: AsyncRead + Unpin>(
        &self,
        ctx: &CallContext,
        reader: &mut R,
    ) -> Result<FileMetadata> {
        ctx.check()?;

        let receiver = TransferReceiver::open(reader, None).await.map_err(|e| {
            tracing::error!("Metadata not received from {}: {}", ctx.peer(), e);
            e
        })?;
        let incoming = receiver.metadata().clone();

        let target = match self.check_upload(&incoming).await {
            Ok(target) => target,
            Err(e) => {
                // Read the rest so the reply is not lost to a reset
                if let Err(drain_err) = discard_stream(reader).await {
                    tracing::debug!("Failed to drain rejected upload: {}", drain_err);
                }
                return Err(e);
            }
        };

        tracing::info!(
            "Storing file '{}' ({} bytes, mtime {}) from {}",
            incoming.name,
            incoming.size,
            incoming.last_modified,
            ctx.peer()
        );

        let partial = partial_path(self.mount_path(), &incoming.name)?;
        let mut file = match tokio::fs::File::create(&partial).await {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("Failed to open file {:?} for writing: {}", partial, e);
                if let Err(drain_err) = discard_stream(reader).await {
                    tracing::debug!("Failed to drain upload after open failure: {}", drain_err);
                }
                return Err(Error::Internal("Failed to open file for writing".into()));
            }
        };

        let received = receiver.receive(reader, &mut file).await;
        drop(file);

        let stored = match received {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!("Upload of '{}' failed: {}", incoming.name, e);
                remove_partial(&partial).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&partial, &target).await {
            tracing::error!("Failed to move upload into place at {:?}: {}", target, e);
            remove_partial(&partial).await;
            return Err(Error::Internal(format!("Failed to store '{}'", incoming.name)));
        }

        // Content is in place; a wrong mtime only costs a later re-sync
        if stored.last_modified > 0 {
            restore_mtime(&target, stored.last_modified);
        }

        self.notifier.notify(CatalogEvent::FileStored(stored.name.clone()));
        Ok(FileMetadata {
            client_id: None,
            ..stored
        })
    }

    /// Reject stale or redundant uploads before any byte is written
    async fn check_upload(&self, incoming: &FileMetadata) -> Result<std::path::PathBuf> {
        let target = resolve_path(self.mount_path(), &incoming.name)?;

        let existing = match stat_file(&target, &incoming.name).await? {
            Some(existing) => existing,
            None => return Ok(target),
        };

        if incoming.last_modified > 0 && incoming.last_modified < existing.last_modified {
            tracing::warn!(
                "Rejecting stale upload of '{}': mtime {} is older than {}",
                incoming.name,
                incoming.last_modified,
                existing.last_modified
            );
            return Err(Error::FailedPrecondition(format!(
                "Server copy of '{}' is newer",
                incoming.name
            )));
        }

        if incoming.crc.is_some() && file_checksum(&target).await? == incoming.crc {
            if incoming.last_modified > existing.last_modified
                && restore_mtime(&target, incoming.last_modified)
            {
                self.notifier.notify(CatalogEvent::FileStored(incoming.name.clone()));
            }
            return Err(Error::AlreadyExists(incoming.name.clone()));
        }

        Ok(target)
    }

    /// Stream a file to the client: metadata first, then chunks
    pub async fn download<W: AsyncWrite + Unpin>(
        &self,
        ctx: &CallContext,
        request: &FileMetadata,
        writer: &mut W,
    ) -> Result<u64> {
        ctx.check()?;

        let mut metadata = self.catalog.stat(Some(request)).await?;
        let path = resolve_path(self.mount_path(), &metadata.name)?;

        let crc = file_checksum(&path)
            .await?
            .ok_or_else(|| Error::NotFound(metadata.name.clone()))?;
        if request.crc == Some(crc) {
            tracing::debug!("Client copy of '{}' is current", metadata.name);
            return Err(Error::AlreadyExists(metadata.name));
        }
        metadata.crc = Some(crc);

        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            tracing::error!("Failed to open file {:?} for reading: {}", path, e);
            Error::Internal("Failed to open file".into())
        })?;

        tracing::info!(
            "Sending file '{}' ({} bytes) to {}",
            metadata.name,
            metadata.size,
            ctx.peer()
        );
        TransferSender::new(metadata, file, self.chunk_size)
            .send(writer)
            .await
    }

    /// Delete a file
    ///
    /// Lock ownership is not checked here; clients take the write lock
    /// before calling RemoveFile.
    pub async fn remove(&self, ctx: &CallContext, request: Option<&FileMetadata>) -> Result<()> {
        ctx.check()?;

        let name = match request {
            Some(meta) if !meta.name.is_empty() => meta.name.clone(),
            _ => return Err(Error::InvalidArgument("Missing request metadata".into())),
        };
        let path = resolve_path(self.mount_path(), &name)?;

        if stat_file(&path, &name).await?.is_none() {
            return Err(Error::NotFound(name));
        }

        tokio::fs::remove_file(&path).await.map_err(|e| {
            tracing::error!("Failed to remove {:?}: {}", path, e);
            Error::Internal(format!("Failed to remove '{}'", name))
        })?;

        tracing::info!("Removed file '{}' for {}", name, ctx.peer());
        self.notifier.notify(CatalogEvent::FileRemoved(name));
        Ok(())
    }
}

/// Set `path`'s mtime, logging rather than failing; returns whether it took
fn restore_mtime(path: &Path, epoch_secs: u64) -> bool {
    match set_mtime(path, epoch_secs) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Failed to set mtime {} on {:?}: {}", epoch_secs, path, e);
            false
        }
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove partial upload {:?}: {}", path, e);
        }
    }
}
