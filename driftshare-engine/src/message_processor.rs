use std::io;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use driftshare_core::error::ShareError;
use driftshare_core::protocol::{CHUNK_SIZE, FileDescriptor, Message, write_message};

use crate::catalog::Catalog;
use crate::events::EventSink;

/// Error text sent when a requested file is not shared or cannot be opened.
pub const FILE_NOT_FOUND: &str = "File not found";

/// Dispatches one decoded request and writes its response to `conn`.
///
/// Returns `Ok(())` when the session can keep reading, `Err(..)` when it
/// must be torn down (write failure, file stream aborted).
pub async fn process_message<W, K>(
    conn: &mut W,
    peer: &str,
    msg: Message,
    catalog: &Arc<K>,
    events: &EventSink,
    shutdown: &CancellationToken,
) -> Result<(), ShareError>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
    K: Catalog,
{
    debug!(peer = %peer, msg_type = msg.tag(), "Processing message");

    match msg {
        Message::FileListRequest => handle_file_list_request(conn, peer, catalog).await,
        Message::FileRequest { filename } => {
            handle_file_request(conn, peer, &filename, catalog.as_ref(), shutdown).await
        }
        Message::Ping => write_message(conn, &Message::Pong).await,
        Message::Unknown { tag } => {
            events.log(format!("Unknown message type from {peer}: {tag}"));
            Ok(())
        }
        other @ (Message::FileListResponse { .. } | Message::FileResponse { .. } | Message::Pong) => {
            events.log(format!("Unexpected {} message from {peer}", other.tag()));
            Ok(())
        }
    }
}

async fn handle_file_list_request<W, K>(
    conn: &mut W,
    peer: &str,
    catalog: &Arc<K>,
) -> Result<(), ShareError>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
    K: Catalog,
{
    // Hashing reads every shared file; keep it off the runtime threads.
    let catalog = Arc::clone(catalog);
    let files = tokio::task::spawn_blocking(move || build_file_list(catalog.as_ref()))
        .await
        .map_err(io::Error::other)?;

    info!(peer = %peer, count = files.len(), "Sending file list");
    write_message(conn, &Message::FileListResponse { files }).await
}

/// Describes every shared file that can still be resolved and sized.
pub fn build_file_list<K: Catalog + ?Sized>(catalog: &K) -> Vec<FileDescriptor> {
    catalog
        .list_names()
        .into_iter()
        .filter_map(|name| {
            let path = catalog.resolve(&name)?;
            let size_bytes = catalog.size_of(&path)?;
            let content_hash = catalog.content_hash(&path);
            Some(FileDescriptor {
                name,
                size_bytes,
                content_hash,
            })
        })
        .collect()
}

async fn handle_file_request<W, K>(
    conn: &mut W,
    peer: &str,
    filename: &str,
    catalog: &K,
    shutdown: &CancellationToken,
) -> Result<(), ShareError>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
    K: Catalog,
{
    let Some(path) = catalog.resolve(filename) else {
        info!(peer = %peer, file = %filename, "Requested file is not shared");
        return write_message(conn, &Message::file_missing(FILE_NOT_FOUND)).await;
    };

    let mut file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(peer = %peer, path = %path.display(), error = %e, "Failed to open shared file");
            return write_message(conn, &Message::file_missing(FILE_NOT_FOUND)).await;
        }
    };
    // The announced size comes from the open handle so it matches what is
    // streamed even if the path is replaced meanwhile.
    let size = file.metadata().await?.len();

    write_message(conn, &Message::file_found(filename, size)).await?;
    stream_file(&mut file, conn, size, shutdown).await?;
    info!(peer = %peer, file = %filename, bytes = size, "File sent");
    Ok(())
}

/// Copies exactly `size` bytes of `file` to `conn` in [`CHUNK_SIZE`] pieces.
async fn stream_file<W>(
    file: &mut File,
    conn: &mut W,
    size: u64,
    shutdown: &CancellationToken,
) -> Result<(), ShareError>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut remaining = size;

    while remaining > 0 {
        if shutdown.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "server stopping").into());
        }
        let want = usize::try_from(remaining).map_or(CHUNK_SIZE, |r| r.min(CHUNK_SIZE));
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "shared file shrank while streaming",
            )
            .into());
        }
        conn.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }

    conn.flush().await?;
    Ok(())
}
