use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use driftshare_core::error::ShareError;
use driftshare_core::protocol::read_message;
use driftshare_core::transport::Connection;

use crate::catalog::Catalog;
use crate::events::EventSink;
use crate::message_processor::process_message;

/// Trait for handling accepted connections.
///
/// The server calls [`handle`](SessionHandler::handle) for every inbound
/// connection, each in its own spawned task, and expects it to return once
/// the connection is finished. `shutdown` is cancelled when the server
/// stops.
///
/// Wrap shared state in the implementor itself; the server clones an
/// `Arc<H>` for every spawned task.
pub trait SessionHandler<C: Connection>: Send + Sync + 'static {
    fn handle(&self, conn: C, shutdown: CancellationToken) -> impl Future<Output = ()> + Send;
}

/// Serves file list, file and ping requests from the shared catalog.
///
/// A session alternates between waiting for a request and answering it.
/// It ends on a clean close, on any protocol or I/O error, or when the
/// server stops. An unknown request type is logged and skipped.
pub struct FileShareSession<K: Catalog> {
    catalog: Arc<K>,
    events: EventSink,
}

impl<K: Catalog> FileShareSession<K> {
    pub fn new(catalog: Arc<K>, events: EventSink) -> Self {
        Self { catalog, events }
    }
}

impl<C: Connection, K: Catalog> SessionHandler<C> for FileShareSession<K> {
    async fn handle(&self, mut conn: C, shutdown: CancellationToken) {
        let peer = conn.peer();
        info!(peer = %peer, "Session started");

        loop {
            let received = select! {
                biased;

                () = shutdown.cancelled() => {
                    info!(peer = %peer, "Server stopping, closing session");
                    break;
                }
                res = read_message(&mut conn) => res,
            };

            match received {
                Ok(Some(msg)) => {
                    // A peer that stops reading must not hold a response
                    // write open past server stop.
                    let processed = select! {
                        biased;

                        () = shutdown.cancelled() => {
                            info!(peer = %peer, "Server stopping, abandoning response");
                            break;
                        }
                        res = process_message(&mut conn, &peer, msg, &self.catalog, &self.events, &shutdown) => res,
                    };
                    if let Err(e) = processed {
                        warn!(peer = %peer, error = %e, "Error processing message, closing session");
                        break;
                    }
                }
                Ok(None) => {
                    info!(peer = %peer, "Connection closed by peer");
                    break;
                }
                Err(ShareError::Protocol(e)) => {
                    // Framing is lost; the stream cannot be resynchronised.
                    warn!(peer = %peer, error = %e, "Protocol error, closing session");
                    break;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Read error, closing session");
                    break;
                }
            }
        }

        let _ = conn.shutdown().await;
    }
}
