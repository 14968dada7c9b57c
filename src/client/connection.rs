//! Server Connection
//!
//! Opens one TCP connection per call and speaks the framed protocol.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::WolfStoreConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    deadline_after, read_message, read_message_within, write_message_within, Catalog,
    FileMetadata, Message, Reply, Request, TransferReceiver, TransferSender,
};

/// Client for the file server
#[derive(Debug, Clone)]
pub struct StoreClient {
    /// Server address (host:port)
    address: String,
    /// Connection timeout
    connect_timeout: Duration,
    /// Deadline applied to every call
    deadline: Duration,
}

impl StoreClient {
    /// Create a new client
    pub fn new(address: impl Into<String>, connect_timeout: Duration, deadline: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
            deadline,
        }
    }

    pub fn from_config(config: &WolfStoreConfig) -> Self {
        Self::new(
            config.client.server_address.clone(),
            config.connect_timeout(),
            config.deadline(),
        )
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Unary call bounded by the deadline
    pub async fn call(&self, request: Request) -> Result<Reply> {
        let result = timeout(self.deadline, async {
            let (mut reader, _writer) = self.open_call(request).await?;
            expect_reply(read_message(&mut reader).await?)
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::DeadlineExceeded),
        }
    }

    /// Stream `reader` to the server as `metadata.name`
    ///
    /// The deadline bounds each frame, not the whole transfer.
    pub async fn upload<R: AsyncRead + Unpin>(
        &self,
        metadata: FileMetadata,
        reader: R,
        chunk_size: usize,
    ) -> Result<FileMetadata> {
        let (mut conn_reader, mut conn_writer) = self.open_call(Request::UploadFile).await?;

        let sent = TransferSender::new(metadata, reader, chunk_size)
            .with_frame_timeout(Some(self.deadline))
            .send(&mut conn_writer)
            .await;

        // The server may have answered early and stopped reading; its reply wins
        let reply = read_message_within(&mut conn_reader, Some(self.deadline)).await;
        match (sent, reply) {
            (_, Ok(message)) => match expect_reply(message)? {
                Reply::Context(stored) => Ok(stored),
                other => Err(unexpected_reply(&other)),
            },
            (Err(send_err), Err(_)) => Err(send_err),
            (Ok(_), Err(read_err)) => Err(read_err),
        }
    }

    /// Download `request.name` into `writer`, returning the server's metadata
    pub async fn download<W: AsyncWrite + Unpin>(
        &self,
        request: FileMetadata,
        writer: &mut W,
    ) -> Result<FileMetadata> {
        let (mut conn_reader, _conn_writer) = self.open_call(Request::DownloadFile(request)).await?;

        let receiver = TransferReceiver::open(&mut conn_reader, Some(self.deadline)).await?;
        receiver.receive(&mut conn_reader, writer).await
    }

    /// Open the catalog callback feed
    pub async fn subscribe(&self) -> Result<CatalogSubscription> {
        let (reader, writer) = self.open_call(Request::CallbackList).await?;
        Ok(CatalogSubscription {
            reader,
            _writer: writer,
        })
    }

    /// Connect and send the call header
    async fn open_call(&self, request: Request) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
        let stream = self.connect().await?;
        let (reader, mut writer) = stream.into_split();

        let call = Message::Call {
            deadline_ms: deadline_after(self.deadline),
            request,
        };
        write_message_within(&mut writer, &call, Some(self.deadline)).await?;
        Ok((reader, writer))
    }

    /// Connect to the server
    async fn connect(&self) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(&self.address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: self.address.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(self.address.clone())),
        }
    }
}

/// Open CallbackList connection
pub struct CatalogSubscription {
    reader: OwnedReadHalf,
    /// Dropping the write half tells the server we left
    _writer: OwnedWriteHalf,
}

impl CatalogSubscription {
    /// Next pushed snapshot, `None` once the server closes the feed
    pub async fn next(&mut self) -> Result<Option<Catalog>> {
        match read_message(&mut self.reader).await {
            Ok(Message::Snapshot(catalog)) => Ok(Some(catalog)),
            Ok(Message::Error(status)) => Err(Error::Remote(status)),
            Ok(other) => Err(Error::Protocol(format!(
                "Unexpected {} on catalog feed",
                other.type_name()
            ))),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn expect_reply(message: Message) -> Result<Reply> {
    match message {
        Message::Reply(reply) => Ok(reply),
        Message::Error(status) => Err(Error::Remote(status)),
        other => Err(Error::Protocol(format!("Expected reply, got {}", other.type_name()))),
    }
}

pub(crate) fn unexpected_reply(reply: &Reply) -> Error {
    Error::Protocol(format!("Unexpected reply {:?}", reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusCode;

    #[tokio::test]
    async fn test_connection_failure() {
        let client = StoreClient::new(
            "127.0.0.1:1",
            Duration::from_millis(200),
            Duration::from_millis(500),
        );

        let err = client.call(Request::ListFiles).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ConnectionFailed { .. } | Error::ConnectionTimeout(_) | Error::DeadlineExceeded
        ));
    }

    #[tokio::test]
    async fn test_silent_server_hits_deadline() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let client = StoreClient::new(
            addr.to_string(),
            Duration::from_secs(1),
            Duration::from_millis(100),
        );
        let err = client.call(Request::ListFiles).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::DeadlineExceeded);
    }

    #[test]
    fn test_expect_reply() {
        assert!(matches!(expect_reply(Message::Reply(Reply::Empty)), Ok(Reply::Empty)));
        let err = expect_reply(Message::EndOfStream).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
