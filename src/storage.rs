//! Mount directory helpers shared by the server and the client

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::protocol::{epoch_seconds, FileMetadata};

/// Prefix of in-flight transfer files; never listed or reconciled
pub const PARTIAL_PREFIX: &str = ".wolfstore-partial-";

/// Join `name` onto the mount directory
///
/// Only plain relative names are accepted.
pub fn resolve_path(mount_path: &Path, name: &str) -> Result<PathBuf> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("Missing file name".into()));
    }

    let relative = Path::new(name);
    if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(Error::InvalidArgument(format!("Invalid file name '{}'", name)));
    }

    Ok(mount_path.join(relative))
}

/// Scratch path a transfer of `name` is written to before it is renamed into place
pub fn partial_path(mount_path: &Path, name: &str) -> Result<PathBuf> {
    let target = resolve_path(mount_path, name)?;
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(target.with_file_name(format!(
        "{}{}-{}",
        PARTIAL_PREFIX,
        uuid::Uuid::new_v4().simple(),
        file_name
    )))
}

/// Whether a directory entry is an in-flight transfer
pub fn is_partial(name: &str) -> bool {
    name.starts_with(PARTIAL_PREFIX)
}

/// Metadata of a regular file, `None` if absent or not a regular file
pub async fn stat_file(path: &Path, name: &str) -> Result<Option<FileMetadata>> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if !meta.is_file() {
        return Ok(None);
    }

    Ok(Some(FileMetadata {
        name: name.to_string(),
        size: meta.len(),
        last_modified: meta.modified().map(epoch_seconds).unwrap_or(0),
        crc: None,
        client_id: None,
    }))
}

/// Set a file's modification time to `epoch_secs`
pub fn set_mtime(path: &Path, epoch_secs: u64) -> Result<()> {
    let time = filetime::FileTime::from_unix_time(epoch_secs as i64, 0);
    filetime::set_file_mtime(path, time)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_escapes() {
        let mount = Path::new("/srv/wolfstore");
        assert_eq!(
            resolve_path(mount, "a.txt").unwrap(),
            PathBuf::from("/srv/wolfstore/a.txt")
        );
        assert!(resolve_path(mount, "").is_err());
        assert!(resolve_path(mount, "../etc/passwd").is_err());
        assert!(resolve_path(mount, "/etc/passwd").is_err());
    }

    #[test]
    fn test_partial_path_is_hidden_sibling() {
        let mount = Path::new("/srv/wolfstore");
        let partial = partial_path(mount, "a.txt").unwrap();
        let name = partial.file_name().unwrap().to_string_lossy().into_owned();
        assert!(is_partial(&name));
        assert!(name.ends_with("a.txt"));
        assert_eq!(partial.parent(), Some(mount));
    }

    #[tokio::test]
    async fn test_stat_reports_mtime_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"0123456789").unwrap();
        set_mtime(&path, 1_620_000_000).unwrap();

        let meta = stat_file(&path, "a.txt").await.unwrap().unwrap();
        assert_eq!(meta.size, 10);
        assert_eq!(meta.last_modified, 1_620_000_000);

        assert!(stat_file(dir.path(), "dir").await.unwrap().is_none());
        assert!(stat_file(&dir.path().join("missing"), "missing").await.unwrap().is_none());
    }
}
