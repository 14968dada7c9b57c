//! Protocol Module
//!
//! Framed messages over TCP and the transfer stream codec built on them.

pub mod message;
pub mod transfer;

pub use message::{Catalog, FileContext, FileMetadata, FrameHeader, Message, Reply, Request};
pub use transfer::{TransferReceiver, TransferSender};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Largest accepted frame body
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length as usize > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "Frame of {} bytes exceeds limit of {}",
            header.length, MAX_FRAME_SIZE
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Protocol("Message checksum mismatch".into()));
    }

    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

/// Read a message, failing with `DeadlineExceeded` if the peer stays silent for `limit`
pub async fn read_message_within<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    limit: Option<Duration>,
) -> Result<Message> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, read_message(reader))
            .await
            .map_err(|_| Error::DeadlineExceeded)?,
        None => read_message(reader).await,
    }
}

/// Write a message, failing with `DeadlineExceeded` if the peer stops reading for `limit`
pub async fn write_message_within<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
    limit: Option<Duration>,
) -> Result<()> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, write_message(writer, message))
            .await
            .map_err(|_| Error::DeadlineExceeded)?,
        None => write_message(writer, message).await,
    }
}

/// Current time in epoch milliseconds
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Absolute deadline for a call started now
pub fn deadline_after(timeout: Duration) -> u64 {
    epoch_millis().saturating_add(timeout.as_millis() as u64)
}

/// Whether a call deadline has already passed (0 never expires)
pub fn deadline_expired(deadline_ms: u64) -> bool {
    deadline_ms != 0 && epoch_millis() >= deadline_ms
}

/// Convert a filesystem timestamp to epoch seconds
pub fn epoch_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
