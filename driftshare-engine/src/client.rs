use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time;
use tracing::{debug, info, warn};

use driftshare_core::error::{ProtocolError, ShareError};
use driftshare_core::protocol::{
    CHUNK_SIZE, FileDescriptor, Message, SERVICE_ID, read_message, write_message,
};
use driftshare_core::transport::{Connection, Connector, ServiceDiscovery};

use crate::config::ClientTimeouts;
use crate::events::{EventSink, ShareEvent};

/// Issues requests to remote peers: one connection per request.
///
/// Every wait (service lookup, connect, each send and each read) is bounded
/// by the timeout passed to the operation, so a stalled peer only fails the
/// request it stalls.
pub struct PeerClient<K: Connector, D: ServiceDiscovery> {
    connector: K,
    discovery: Arc<D>,
    events: EventSink,
    timeouts: ClientTimeouts,
}

impl<K: Connector, D: ServiceDiscovery> PeerClient<K, D> {
    pub fn new(connector: K, discovery: Arc<D>, events: EventSink) -> Self {
        Self {
            connector,
            discovery,
            events,
            timeouts: ClientTimeouts::default(),
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: ClientTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Timeouts applied by the CLI when it does not pass its own.
    pub fn timeouts(&self) -> ClientTimeouts {
        self.timeouts
    }

    /// Asks the peer at `address` for the files it shares.
    ///
    /// # Errors
    ///
    /// [`ShareError::ServiceNotFound`] when the peer does not advertise the
    /// service (no connection is attempted), [`ShareError::Timeout`] when a
    /// step exceeds `timeout`, and transport or protocol errors otherwise.
    pub async fn list_files(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Vec<FileDescriptor>, ShareError> {
        let mut conn = self.open(address, timeout).await?;
        let response = exchange(&mut conn, &Message::FileListRequest, timeout).await;
        close(&mut conn).await;

        match response? {
            Message::FileListResponse { files } => {
                debug!(peer = %address, count = files.len(), "Received file list");
                Ok(files)
            }
            other => Err(unexpected("file_list_response", &other)),
        }
    }

    /// Downloads `filename` from the peer at `address` into `destination`
    /// and returns the number of bytes written.
    ///
    /// On success [`ShareEvent::FileReceived`] is emitted. If the transfer
    /// fails after `destination` was created, the partial file is removed.
    ///
    /// # Errors
    ///
    /// [`ShareError::Remote`] when the peer refuses the request,
    /// [`ShareError::IncompleteTransfer`] when the stream ends early, plus
    /// everything [`list_files`](Self::list_files) can return.
    pub async fn fetch_file(
        &self,
        address: &str,
        filename: &str,
        destination: &Path,
        timeout: Duration,
    ) -> Result<u64, ShareError> {
        let mut conn = self.open(address, timeout).await?;
        let request = Message::FileRequest {
            filename: filename.to_owned(),
        };

        let expected = match exchange(&mut conn, &request, timeout).await {
            Ok(Message::FileResponse {
                success: true,
                size,
                ..
            }) => size.unwrap_or(0),
            Ok(Message::FileResponse { error, .. }) => {
                close(&mut conn).await;
                return Err(ShareError::Remote(
                    error.unwrap_or_else(|| "Unknown error".into()),
                ));
            }
            Ok(other) => {
                close(&mut conn).await;
                return Err(unexpected("file_response", &other));
            }
            Err(e) => {
                close(&mut conn).await;
                return Err(e);
            }
        };

        info!(peer = %address, file = %filename, bytes = expected, "Receiving file");
        let outcome = receive_file(&mut conn, destination, expected, timeout).await;
        close(&mut conn).await;

        match outcome {
            Ok(received) => {
                info!(peer = %address, file = %filename, bytes = received, "File received");
                self.events.emit(ShareEvent::FileReceived {
                    filename: filename.to_owned(),
                    address: address.to_owned(),
                    path: destination.to_path_buf(),
                });
                Ok(received)
            }
            Err(e) => {
                warn!(peer = %address, file = %filename, error = %e, "Download failed, removing partial file");
                discard(destination).await;
                Err(e)
            }
        }
    }

    /// Whether the peer at `address` answers a ping within `timeout`.
    pub async fn ping(&self, address: &str, timeout: Duration) -> bool {
        match self.try_ping(address, timeout).await {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %address, error = %e, "Ping failed");
                false
            }
        }
    }

    async fn try_ping(&self, address: &str, timeout: Duration) -> Result<(), ShareError> {
        let mut conn = self.open(address, timeout).await?;
        let response = exchange(&mut conn, &Message::Ping, timeout).await;
        close(&mut conn).await;

        match response? {
            Message::Pong => Ok(()),
            other => Err(unexpected("pong", &other)),
        }
    }

    /// Resolves the service port on `address` and connects to it.
    async fn open(&self, address: &str, timeout: Duration) -> Result<K::Conn, ShareError> {
        let lookup = time::timeout(timeout, self.discovery.find_service(SERVICE_ID, address));
        let port = match lookup.await {
            Err(_) => {
                return Err(ShareError::Timeout {
                    operation: "service lookup",
                });
            }
            Ok(Err(e)) => {
                return Err(ShareError::Transport(
                    e.context(format!("service lookup on {address} failed")),
                ));
            }
            Ok(Ok(None)) => {
                return Err(ShareError::ServiceNotFound {
                    address: address.to_owned(),
                });
            }
            Ok(Ok(Some(port))) => port,
        };

        debug!(peer = %address, port, "Connecting");
        match time::timeout(timeout, self.connector.connect(address, port)).await {
            Err(_) => Err(ShareError::Timeout {
                operation: "connect",
            }),
            Ok(Err(e)) => Err(ShareError::Transport(e)),
            Ok(Ok(conn)) => Ok(conn),
        }
    }
}

/// Sends `request` and reads one response, each bounded by `timeout`.
async fn exchange<C: Connection>(
    conn: &mut C,
    request: &Message,
    timeout: Duration,
) -> Result<Message, ShareError> {
    time::timeout(timeout, write_message(conn, request))
        .await
        .map_err(|_| ShareError::Timeout {
            operation: "send request",
        })??;

    match time::timeout(timeout, read_message(conn)).await {
        Err(_) => Err(ShareError::Timeout {
            operation: "read response",
        }),
        Ok(Err(e)) => Err(e),
        Ok(Ok(None)) => Err(ProtocolError::Truncated.into()),
        Ok(Ok(Some(msg))) => Ok(msg),
    }
}

/// Writes exactly `expected` bytes from `conn` to a new file at
/// `destination`.
async fn receive_file<R>(
    conn: &mut R,
    destination: &Path,
    expected: u64,
    timeout: Duration,
) -> Result<u64, ShareError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut file = File::create(destination).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut received: u64 = 0;

    while received < expected {
        let want = usize::try_from(expected - received).map_or(CHUNK_SIZE, |r| r.min(CHUNK_SIZE));
        let n = time::timeout(timeout, conn.read(&mut buf[..want]))
            .await
            .map_err(|_| ShareError::Timeout {
                operation: "read file data",
            })??;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        received += n as u64;
    }
    file.flush().await?;

    if received != expected {
        return Err(ShareError::IncompleteTransfer { received, expected });
    }
    Ok(received)
}

async fn close<C: Connection>(conn: &mut C) {
    if let Err(e) = conn.shutdown().await {
        debug!(error = %e, "Error while closing connection");
    }
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial file"),
    }
}

fn unexpected(expected: &'static str, actual: &Message) -> ShareError {
    ShareError::UnexpectedResponse {
        expected,
        actual: actual.tag().to_owned(),
    }
}
