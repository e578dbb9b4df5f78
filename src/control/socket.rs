//! Unix socket IPC transport.
//!
//! The proxy process and the privileged daemon each listen on a Unix socket.
//! Every connection carries exactly one request and one response, after
//! which the server closes it.
//!
//! # Message Framing
//!
//! ```text
//! [4 bytes: message length (big-endian u32)]
//! [N bytes: JSON-encoded IpcRequest / IpcResponse]
//! ```

use super::protocol::{IpcRequest, IpcResponse};
use async_trait::async_trait;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Errors from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,
    /// Message too large.
    #[error("Message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),
    /// Another live server owns the socket path.
    #[error("Socket {0:?} is already in use")]
    AddressInUse(PathBuf),
    /// No response within the client timeout.
    #[error("No response within {0:?}")]
    Timeout(Duration),
}

/// Maximum message size (16 MB should be plenty).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default client round-trip timeout.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Result type for socket operations.
pub type SocketResult<T> = Result<T, SocketError>;

/// Error returned by a [`MessageHandler`]; reported to the peer as `err`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Server-side message dispatch.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one request.
    ///
    /// `Ok` becomes `{processed: true, data}`, `Err` becomes
    /// `{processed: false, err}`. Unknown message types should answer
    /// `Ok(None)`.
    async fn handle(&self, request: IpcRequest) -> Result<Option<Value>, HandlerError>;
}

/// One-shot request/response server on a Unix socket.
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Bind at `socket_path`.
    ///
    /// A leftover socket file with nobody listening is removed first. A path
    /// that still accepts connections yields [`SocketError::AddressInUse`].
    pub async fn bind<P: AsRef<Path>>(socket_path: P) -> SocketResult<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        clear_stale_socket(&socket_path).await?;

        let listener = UnixListener::bind(&socket_path).map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse => SocketError::AddressInUse(socket_path.clone()),
            _ => SocketError::Io(e),
        })?;
        info!("IPC server listening on {:?}", socket_path);

        Ok(Self {
            listener,
            socket_path,
        })
    }

    /// Get the socket path.
    pub fn path(&self) -> &Path {
        &self.socket_path
    }

    /// Serve connections until `shutdown_rx` flips to true.
    ///
    /// The socket file is removed when the server stops.
    pub async fn run<H: MessageHandler>(
        self,
        handler: Arc<H>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> SocketResult<()> {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let handler = handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, handler).await
                                    && !matches!(e, SocketError::ConnectionClosed) {
                                        warn!("IPC connection error: {}", e);
                                    }
                            });
                        }
                        Err(e) => warn!("Failed to accept IPC connection: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("IPC server on {:?} shutting down", self.socket_path);
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists()
            && let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!("Failed to remove socket file: {}", e);
            }
    }
}

/// Remove `path` unless a live server answers on it.
async fn clear_stale_socket(path: &Path) -> SocketResult<()> {
    if !path.exists() {
        return Ok(());
    }
    match UnixStream::connect(path).await {
        Ok(_) => Err(SocketError::AddressInUse(path.to_path_buf())),
        Err(_) => {
            debug!("Removing stale socket file {:?}", path);
            std::fs::remove_file(path)?;
            Ok(())
        }
    }
}

async fn serve_connection<H: MessageHandler>(
    stream: UnixStream,
    handler: Arc<H>,
) -> SocketResult<()> {
    let (mut reader, mut writer) = stream.into_split();

    let data = read_message(&mut reader).await?;
    let request: IpcRequest = match serde_json::from_slice(&data) {
        Ok(request) => request,
        Err(e) => {
            debug!("Malformed IPC request: {}", e);
            write_json(&mut writer, &IpcResponse::failed(e)).await?;
            writer.shutdown().await?;
            return Ok(());
        }
    };
    debug!(kind = %request.kind, skip_wait = request.skip_wait, "IPC request");

    if request.skip_wait {
        write_json(&mut writer, &IpcResponse::processed(None)).await?;
        writer.shutdown().await?;
        drop(writer);
        drop(reader);

        let kind = request.kind.clone();
        if let Err(e) = handler.handle(request).await {
            warn!(kind = %kind, "IPC handler failed after acknowledging: {}", e);
        }
        return Ok(());
    }

    let response = match handler.handle(request).await {
        Ok(data) => IpcResponse::processed(data),
        Err(e) => IpcResponse::failed(e),
    };
    write_json(&mut writer, &response).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Client for a one-shot IPC server.
#[derive(Debug, Clone)]
pub struct IpcClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl IpcClient {
    /// Client for the server at `socket_path`.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }

    /// Bound the whole round trip.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the socket path.
    pub fn path(&self) -> &Path {
        &self.socket_path
    }

    /// Send one request and wait for its response.
    pub async fn send(&self, request: &IpcRequest) -> SocketResult<IpcResponse> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| SocketError::Timeout(self.timeout))?
    }

    async fn exchange(&self, request: &IpcRequest) -> SocketResult<IpcResponse> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;
        write_json(&mut stream, request).await?;
        let data = read_message(&mut stream).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// True when the server answers `ping` with `processed: true`.
    pub async fn ping(&self) -> bool {
        matches!(self.send(&IpcRequest::new("ping")).await, Ok(response) if response.processed)
    }
}

async fn write_json<W, T>(writer: &mut W, value: &T) -> SocketResult<()>
where
    W: AsyncWriteExt + Unpin,
    T: serde::Serialize,
{
    let data = serde_json::to_vec(value)?;
    write_message(writer, &data).await
}

/// Read a length-prefixed message from the stream.
async fn read_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> SocketResult<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(SocketError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(SocketError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
    }

    let mut buf = vec![0u8; len];
    match reader.read_exact(&mut buf).await {
        Ok(_) => Ok(buf),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(SocketError::ConnectionClosed)
        }
        Err(e) => Err(e.into()),
    }
}

/// Write a length-prefixed message to the stream.
async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> SocketResult<()> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(SocketError::MessageTooLarge(data.len(), MAX_MESSAGE_SIZE));
    }

    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;

    Ok(())
}
