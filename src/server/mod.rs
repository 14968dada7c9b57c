//! File Server
//!
//! TCP server exposing the mount directory. Each connection carries one
//! call; calls run on their own task and share only the lock table and
//! the directory-listing mutex.

pub mod catalog;
pub mod files;
pub mod locks;
pub mod notifier;

pub use catalog::CatalogService;
pub use files::FileService;
pub use locks::LockManager;
pub use notifier::{CatalogEvent, CatalogPublisher, ChangeNotifier, SnapshotFeed};

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::config::WolfStoreConfig;
use crate::error::{Error, Result, StatusCode};
use crate::protocol::{
    deadline_expired, read_message, write_message, FileMetadata, Message, Reply, Request,
};

/// Per-call context
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline_ms: u64,
    peer: String,
}

impl CallContext {
    pub fn new(deadline_ms: u64, peer: impl Into<String>) -> Self {
        Self {
            deadline_ms,
            peer: peer.into(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether the caller's deadline has already passed
    pub fn is_cancelled(&self) -> bool {
        deadline_expired(self.deadline_ms)
    }

    /// Entry check performed by every handler
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            tracing::error!("Deadline expired for call from {}", self.peer);
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }
}

/// Handlers shared by all connections
struct Services {
    locks: Arc<LockManager>,
    catalog: Arc<CatalogService>,
    files: FileService,
    feed: SnapshotFeed,
}

/// File server bound to its listening socket
pub struct StoreServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    services: Arc<Services>,
    publisher: CatalogPublisher,
    shutdown: Arc<watch::Sender<bool>>,
}

/// Handle for stopping a running server
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl StoreServer {
    /// Prepare the mount directory and bind the listener
    pub async fn bind(config: &WolfStoreConfig) -> Result<Self> {
        let mount_path = config.server.mount_path.clone();
        tokio::fs::create_dir_all(&mount_path).await.map_err(|e| {
            tracing::error!("Failed to create mount directory {:?}: {}", mount_path, e);
            e
        })?;

        let listener = TcpListener::bind(&config.server.bind_address).await?;
        let local_addr = listener.local_addr()?;

        let locks = Arc::new(LockManager::new());
        let catalog = Arc::new(CatalogService::new(mount_path));
        let (publisher, notifier, feed) =
            CatalogPublisher::new(catalog.clone(), config.callback_interval());
        let files = FileService::new(catalog.clone(), notifier, config.transfer.chunk_size);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            listener,
            local_addr,
            services: Arc::new(Services {
                locks,
                catalog,
                files,
                feed,
            }),
            publisher,
            shutdown: Arc::new(shutdown_tx),
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Lock table (for inspection)
    pub fn locks(&self) -> Arc<LockManager> {
        self.services.locks.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Accept calls until stopped
    pub async fn run(self) -> Result<()> {
        tracing::info!(
            "File server listening on {}, serving {:?}",
            self.local_addr,
            self.services.catalog.mount_path()
        );

        let publisher = tokio::spawn(self.publisher.run(self.shutdown.subscribe()));
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let services = self.services.clone();
                            let shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, peer_addr.clone(), services, shutdown).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        let _ = publisher.await;
        tracing::info!("File server stopped");
        Ok(())
    }
}

/// Serve the single call carried by a connection
async fn handle_connection(
    socket: TcpStream,
    peer_addr: String,
    services: Arc<Services>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    let (deadline_ms, request) = match read_message(&mut reader).await {
        Ok(Message::Call { deadline_ms, request }) => (deadline_ms, request),
        Ok(other) => {
            let status = Error::InvalidArgument(format!("Expected call, got {}", other.type_name()))
                .to_status();
            return write_message(&mut writer, &Message::Error(status)).await;
        }
        Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
        Err(e) => return Err(e),
    };

    let method = request.method_name();
    let ctx = CallContext::new(deadline_ms, peer_addr);
    tracing::debug!("{} from {}", method, ctx.peer());

    let result = match request {
        Request::UploadFile => services
            .files
            .upload(&ctx, &mut reader)
            .await
            .map(Reply::Context),
        Request::DownloadFile(metadata) => {
            // Success has already been streamed
            match services.files.download(&ctx, &metadata, &mut writer).await {
                Ok(_) => return Ok(()),
                Err(e) => Err(e),
            }
        }
        Request::RemoveFile(metadata) => services
            .files
            .remove(&ctx, metadata.as_ref())
            .await
            .map(|_| Reply::Empty),
        Request::ListFiles => match ctx.check() {
            Ok(()) => services.catalog.list().await.map(Reply::Catalog),
            Err(e) => Err(e),
        },
        Request::GetFileStatus(metadata) => match ctx.check() {
            Ok(()) => services.catalog.stat(metadata.as_ref()).await.map(Reply::Context),
            Err(e) => Err(e),
        },
        Request::GetWriteLock(metadata) => get_write_lock(&ctx, &services.locks, metadata).await,
        Request::ReleaseWriteLock(metadata) => {
            release_write_lock(&ctx, &services.locks, metadata).await
        }
        Request::CallbackList => {
            return serve_callbacks(&ctx, &services, &mut reader, &mut writer, shutdown).await;
        }
    };

    respond(&mut writer, method, &ctx, result).await
}

async fn respond<W: AsyncWrite + Unpin>(
    writer: &mut W,
    method: &str,
    ctx: &CallContext,
    result: Result<Reply>,
) -> Result<()> {
    let message = match result {
        Ok(reply) => Message::Reply(reply),
        Err(e) => {
            match e.status_code() {
                StatusCode::NotFound | StatusCode::AlreadyExists | StatusCode::FailedPrecondition => {
                    tracing::debug!("{} from {}: {}", method, ctx.peer(), e)
                }
                _ => tracing::warn!("{} from {} failed: {}", method, ctx.peer(), e),
            }
            Message::Error(e.to_status())
        }
    };
    write_message(writer, &message).await
}

/// Split a lock request into (filename, client_id)
fn lock_request(metadata: Option<FileMetadata>) -> Result<(String, String)> {
    match metadata {
        Some(FileMetadata {
            name,
            client_id: Some(client_id),
            ..
        }) if !name.is_empty() && !client_id.is_empty() => Ok((name, client_id)),
        _ => Err(Error::InvalidArgument(
            "Lock requests need a file name and client id".into(),
        )),
    }
}

async fn get_write_lock(
    ctx: &CallContext,
    locks: &LockManager,
    metadata: Option<FileMetadata>,
) -> Result<Reply> {
    ctx.check()?;
    let (name, client_id) = lock_request(metadata)?;
    locks.acquire(&name, &client_id).await?;
    tracing::debug!("Client {} locked file '{}'", client_id, name);
    Ok(Reply::Empty)
}

async fn release_write_lock(
    ctx: &CallContext,
    locks: &LockManager,
    metadata: Option<FileMetadata>,
) -> Result<Reply> {
    ctx.check()?;
    let (name, client_id) = lock_request(metadata)?;
    locks.release(&name, &client_id).await?;
    tracing::debug!("Client {} released file '{}'", client_id, name);
    Ok(Reply::Empty)
}

/// Push catalog snapshots until the client hangs up or the server stops
async fn serve_callbacks<R, W>(
    ctx: &CallContext,
    services: &Services,
    reader: &mut R,
    writer: &mut W,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Err(e) = ctx.check() {
        return write_message(writer, &Message::Error(e.to_status())).await;
    }

    // Subscribe before listing so no change falls between the two
    let mut feed = BroadcastStream::new(services.feed.subscribe());
    let initial = match services.catalog.list().await {
        Ok(catalog) => catalog,
        Err(e) => return write_message(writer, &Message::Error(e.to_status())).await,
    };
    write_message(writer, &Message::Snapshot(initial)).await?;
    tracing::info!("Client {} subscribed to catalog changes", ctx.peer());

    loop {
        tokio::select! {
            item = feed.next() => match item {
                Some(Ok(snapshot)) => {
                    write_message(writer, &Message::Snapshot(snapshot.as_ref().clone())).await?;
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::debug!("Subscriber {} skipped {} snapshots", ctx.peer(), skipped);
                }
                None => break,
            },
            _ = read_message(reader) => break,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!("Client {} unsubscribed", ctx.peer());
    Ok(())
}
