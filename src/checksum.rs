//! File checksums
//!
//! CRC32 over file content, used to skip transfers when both sides
//! already hold the same bytes.

use std::path::Path;
use tokio::io::AsyncReadExt;

use crate::error::Result;

const READ_BUFFER: usize = 64 * 1024;

/// Checksum a byte slice
pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Checksum a file, `None` if it does not exist
pub async fn file_checksum(path: &Path) -> Result<Option<u32>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(Some(hasher.finalize()))
}
