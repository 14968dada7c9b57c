//! Catalog Service
//!
//! Directory listing and single-file status for the mount directory.
//! Metadata is always recomputed from the filesystem.

use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::protocol::{Catalog, FileMetadata};
use crate::storage::{is_partial, resolve_path, stat_file};

/// Lists and stats files under the mount directory
pub struct CatalogService {
    mount_path: PathBuf,
    /// Serializes directory enumeration; independent of the lock table
    directory: Mutex<()>,
}

impl CatalogService {
    pub fn new(mount_path: PathBuf) -> Self {
        Self {
            mount_path,
            directory: Mutex::new(()),
        }
    }

    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    /// Enumerate regular files in filesystem order
    pub async fn list(&self) -> Result<Catalog> {
        let _guard = self.directory.lock().await;

        let mut entries = tokio::fs::read_dir(&self.mount_path).await.map_err(|e| {
            tracing::error!("Failed to open directory {:?}: {}", self.mount_path, e);
            Error::Internal(format!("Failed to open directory {}", self.mount_path.display()))
        })?;

        let mut catalog = Catalog::default();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_partial(&name) {
                continue;
            }
            // Entries may vanish between readdir and stat
            if let Some(meta) = stat_file(&entry.path(), &name).await? {
                catalog.files.push(meta);
            }
        }

        tracing::debug!("Listed {} files in {:?}", catalog.len(), self.mount_path);
        Ok(catalog)
    }

    /// Status of one file
    pub async fn stat(&self, request: Option<&FileMetadata>) -> Result<FileMetadata> {
        let name = match request {
            Some(meta) if !meta.name.is_empty() => &meta.name,
            _ => return Err(Error::InvalidArgument("Missing request metadata".into())),
        };

        let path = resolve_path(&self.mount_path, name)?;
        stat_file(&path, name)
            .await?
            .ok_or_else(|| Error::NotFound(name.clone()))
    }
}
