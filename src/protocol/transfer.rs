//! Transfer Stream Codec
//!
//! A file travels as one metadata-only `Context` message, zero or more
//! content chunks of at most `chunk_size` bytes, and `EndOfStream`.
//! The codec only frames; the caller owns the storage on either end.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::{read_message_within, write_message_within, FileContext, FileMetadata, Message};
use crate::error::{Error, Result};

/// Sending half of a transfer
pub struct TransferSender<R> {
    metadata: FileMetadata,
    reader: BufReader<R>,
    chunk_size: usize,
    frame_timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> TransferSender<R> {
    /// Create a sender for `metadata` whose content is read from `reader`
    pub fn new(metadata: FileMetadata, reader: R, chunk_size: usize) -> Self {
        Self {
            metadata,
            reader: BufReader::with_capacity(chunk_size.max(1), reader),
            chunk_size: chunk_size.max(1),
            frame_timeout: None,
        }
    }

    /// Bound every frame write by `limit`
    pub fn with_frame_timeout(mut self, limit: Option<Duration>) -> Self {
        self.frame_timeout = limit;
        self
    }

    /// Stream metadata, chunks and the end marker; returns content bytes sent
    pub async fn send<W: AsyncWrite + Unpin>(mut self, writer: &mut W) -> Result<u64> {
        let opening = Message::Context(FileContext::metadata(self.metadata.clone()));
        write_message_within(writer, &opening, self.frame_timeout).await?;

        let mut sent = 0u64;
        loop {
            let chunk = self.next_chunk().await?;
            if chunk.is_empty() {
                break;
            }
            sent += chunk.len() as u64;
            write_message_within(writer, &Message::Context(FileContext::chunk(chunk)), self.frame_timeout)
                .await?;
        }

        write_message_within(writer, &Message::EndOfStream, self.frame_timeout).await?;
        tracing::trace!("Sent {} bytes of '{}'", sent, self.metadata.name);
        Ok(sent)
    }

    async fn next_chunk(&mut self) -> Result<Vec<u8>> {
        let mut chunk = Vec::with_capacity(self.chunk_size);
        (&mut self.reader)
            .take(self.chunk_size as u64)
            .read_to_end(&mut chunk)
            .await?;
        Ok(chunk)
    }
}

/// Receiving half of a transfer
#[derive(Debug)]
pub struct TransferReceiver {
    metadata: FileMetadata,
    received: u64,
    hasher: crc32fast::Hasher,
    frame_timeout: Option<Duration>,
}

impl TransferReceiver {
    /// Validate the opening message of a stream
    pub fn start(first: Message) -> Result<Self> {
        match first {
            Message::Context(FileContext {
                metadata: Some(metadata),
                ..
            }) if !metadata.name.is_empty() => Ok(Self {
                metadata,
                received: 0,
                hasher: crc32fast::Hasher::new(),
                frame_timeout: None,
            }),
            Message::Context(_) | Message::EndOfStream => {
                Err(Error::InvalidArgument("Metadata not received".into()))
            }
            Message::Error(status) => Err(Error::Remote(status)),
            other => Err(Error::Protocol(format!(
                "Unexpected {} at start of transfer",
                other.type_name()
            ))),
        }
    }

    /// Read and validate the opening message from `reader`
    pub async fn open<R: AsyncRead + Unpin>(
        reader: &mut R,
        frame_timeout: Option<Duration>,
    ) -> Result<Self> {
        let first = match read_message_within(reader, frame_timeout).await {
            Ok(msg) => msg,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::InvalidArgument("Metadata not received".into()));
            }
            Err(e) => return Err(e),
        };
        let mut receiver = Self::start(first)?;
        receiver.frame_timeout = frame_timeout;
        Ok(receiver)
    }

    /// Metadata announced by the sender
    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    /// Bytes of content accepted so far
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Accept one content chunk, returning the bytes to store
    pub fn accept(&mut self, context: FileContext) -> Result<Vec<u8>> {
        if context.metadata.is_some() {
            return Err(Error::InvalidArgument(
                "Metadata repeated inside transfer".into(),
            ));
        }

        let total = self.received + context.content.len() as u64;
        if total > self.metadata.size {
            return Err(Error::IncompleteTransfer {
                expected: self.metadata.size,
                received: total,
            });
        }

        self.hasher.update(&context.content);
        self.received = total;
        Ok(context.content)
    }

    /// Close the transfer; the byte count must equal the declared size
    pub fn finish(self) -> Result<FileMetadata> {
        if self.received != self.metadata.size {
            return Err(Error::IncompleteTransfer {
                expected: self.metadata.size,
                received: self.received,
            });
        }

        let computed = self.hasher.finalize();
        if let Some(declared) = self.metadata.crc {
            if declared != computed {
                return Err(Error::ChecksumMismatch { declared, computed });
            }
        }

        let mut metadata = self.metadata;
        metadata.crc = Some(computed);
        Ok(metadata)
    }

    /// Copy the remaining chunks into `writer` and close the transfer
    pub async fn receive<R, W>(mut self, reader: &mut R, writer: &mut W) -> Result<FileMetadata>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let message = match read_message_within(reader, self.frame_timeout).await {
                Ok(msg) => msg,
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(Error::IncompleteTransfer {
                        expected: self.metadata.size,
                        received: self.received,
                    });
                }
                Err(e) => return Err(e),
            };

            match message {
                Message::Context(context) => {
                    let data = self.accept(context)?;
                    writer.write_all(&data).await?;
                }
                Message::EndOfStream => break,
                Message::Error(status) => return Err(Error::Remote(status)),
                other => {
                    return Err(Error::Protocol(format!(
                        "Unexpected {} inside transfer",
                        other.type_name()
                    )))
                }
            }
        }

        writer.flush().await?;
        self.finish()
    }
}

/// Consume the rest of a transfer without storing it
pub async fn discard_stream<R: AsyncRead + Unpin>(reader: &mut R) -> Result<()> {
    loop {
        match super::read_message(reader).await {
            Ok(Message::EndOfStream) => return Ok(()),
            Ok(Message::Context(_)) => continue,
            Ok(other) => {
                return Err(Error::Protocol(format!(
                    "Unexpected {} inside transfer",
                    other.type_name()
                )))
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}
