use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use driftshare_core::error::ShareError;
use driftshare_core::protocol::{SERVICE_ID, SERVICE_NAME};
use driftshare_core::transport::{Connection, Listener, ListenerFactory, ServiceDiscovery};

use crate::catalog::Catalog;
use crate::events::{EventSink, ShareEvent};
use crate::session::{FileShareSession, SessionHandler};

/// A connection currently served by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenConnection {
    pub address: String,
    pub port: u16,
}

struct LiveConnection {
    info: OpenConnection,
    shutdown: CancellationToken,
}

/// Connections being served, keyed by a per-server id.
#[derive(Default)]
struct ConnectionSet {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, LiveConnection>>,
}

impl ConnectionSet {
    fn insert(&self, info: OpenConnection, shutdown: CancellationToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.lock().insert(id, LiveConnection { info, shutdown });
        id
    }

    fn remove(&self, id: u64) {
        self.live.lock().remove(&id);
    }

    /// Asks every session to end. Entries stay until each session exits.
    fn close_all(&self) -> usize {
        let live = self.live.lock();
        for conn in live.values() {
            conn.shutdown.cancel();
        }
        live.len()
    }

    fn snapshot(&self) -> Vec<OpenConnection> {
        let mut open: Vec<OpenConnection> =
            self.live.lock().values().map(|c| c.info.clone()).collect();
        open.sort_by(|a, b| (&a.address, a.port).cmp(&(&b.address, b.port)));
        open
    }
}

struct RunningServer {
    port: u16,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

/// Accepts connections on one listener and serves the shared catalog.
///
/// Generic over the listener factory and discovery so the same server runs
/// over TCP with mDNS in production and over fakes in tests.
pub struct TransportServer<F, D, K>
where
    F: ListenerFactory,
    D: ServiceDiscovery,
    K: Catalog,
{
    factory: F,
    discovery: Arc<D>,
    catalog: Arc<K>,
    events: EventSink,
    connections: Arc<ConnectionSet>,
    // Held across the bind/advertise awaits so start and stop never overlap.
    running: tokio::sync::Mutex<Option<RunningServer>>,
}

impl<F, D, K> TransportServer<F, D, K>
where
    F: ListenerFactory,
    D: ServiceDiscovery,
    K: Catalog,
{
    pub fn new(factory: F, discovery: Arc<D>, catalog: Arc<K>, events: EventSink) -> Self {
        Self {
            factory,
            discovery,
            catalog,
            events,
            connections: Arc::new(ConnectionSet::default()),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Binds a listener on `bind_addr`, advertises the service on the bound
    /// port and starts accepting. Returns the bound port.
    ///
    /// Starting an already running server returns its current port.
    ///
    /// # Errors
    ///
    /// [`ShareError::Transport`] when binding or advertising fails. A
    /// listener that bound but could not be advertised is released.
    pub async fn start(&self, bind_addr: &str) -> Result<u16, ShareError> {
        let mut running = self.running.lock().await;
        if let Some(server) = running.as_ref() {
            warn!(port = server.port, "Server already running");
            return Ok(server.port);
        }

        let listener = self.factory.bind(bind_addr).await.map_err(|e| {
            warn!(addr = %bind_addr, error = %e, "Failed to bind listener");
            ShareError::Transport(e)
        })?;
        let port = listener.local_port();

        if let Err(e) = self.discovery.advertise(SERVICE_ID, port).await {
            warn!(port, error = %e, "Failed to advertise service, releasing listener");
            drop(listener);
            return Err(ShareError::Transport(e.context("failed to advertise service")));
        }

        let shutdown = CancellationToken::new();
        let handler = Arc::new(FileShareSession::new(
            Arc::clone(&self.catalog),
            self.events.clone(),
        ));
        let accept_task = tokio::spawn(run_accept_loop(
            listener,
            handler,
            Arc::clone(&self.connections),
            self.events.clone(),
            shutdown.clone(),
        ));

        self.events.log(format!("{SERVICE_NAME} listening on port {port}"));
        *running = Some(RunningServer {
            port,
            shutdown,
            accept_task,
        });
        Ok(port)
    }

    /// Stops accepting, withdraws the advertisement and asks every open
    /// session to end. Safe to call when not running and to call twice.
    pub async fn stop(&self) {
        let Some(server) = self.running.lock().await.take() else {
            debug!("Stop requested but server is not running");
            return;
        };

        server.shutdown.cancel();
        if let Err(e) = self.discovery.stop_advertising().await {
            warn!(error = %e, "Failed to withdraw service advertisement");
        }
        let closing = self.connections.close_all();
        if let Err(e) = server.accept_task.await {
            warn!(error = %e, "Accept loop task failed");
        }

        info!(port = server.port, closing, "Server stopped");
        self.events.log("Server stopped");
    }

    /// The bound port while the server is running.
    pub async fn local_port(&self) -> Option<u16> {
        self.running.lock().await.as_ref().map(|s| s.port)
    }

    /// Connections currently being served, sorted by address.
    pub fn open_connections(&self) -> Vec<OpenConnection> {
        self.connections.snapshot()
    }
}

/// Accepts connections until `shutdown` is cancelled or the listener
/// fails, spawning one session task per connection.
async fn run_accept_loop<L, H>(
    mut listener: L,
    handler: Arc<H>,
    connections: Arc<ConnectionSet>,
    events: EventSink,
    shutdown: CancellationToken,
) where
    L: Listener,
    H: SessionHandler<L::Conn>,
{
    debug!(port = listener.local_port(), "Accept loop running");

    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                debug!("Accept loop cancelled");
                break;
            }

            result = listener.accept() => match result {
                Ok(conn) => {
                    let info = OpenConnection {
                        address: conn.peer(),
                        port: conn.peer_port(),
                    };
                    let session_shutdown = shutdown.child_token();
                    let id = connections.insert(info.clone(), session_shutdown.clone());

                    info!(peer = %info.address, port = info.port, "Connection accepted");
                    events.emit(ShareEvent::PeerConnected {
                        address: info.address.clone(),
                        port: info.port,
                    });

                    let handler = Arc::clone(&handler);
                    let connections = Arc::clone(&connections);
                    let events = events.clone();
                    tokio::spawn(async move {
                        handler.handle(conn, session_shutdown).await;
                        connections.remove(id);
                        info!(peer = %info.address, port = info.port, "Connection closed");
                        events.emit(ShareEvent::PeerDisconnected {
                            address: info.address,
                            port: info.port,
                        });
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Listener failed, no longer accepting");
                    events.log(format!("Server stopped accepting connections: {e:#}"));
                    break;
                }
            }
        }
    }

    info!("Accept loop stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use driftshare_core::protocol::{Message, read_message, write_message};
    use driftshare_core::transport::Connector;
    use tokio::sync::broadcast;

    use super::*;
    use crate::catalog::SharedCatalog;
    use crate::tcp::{TcpConnector, TcpListenerFactory};
    use crate::testing::{LOCALHOST, StaticDiscovery};

    type TestServer = TransportServer<TcpListenerFactory, StaticDiscovery, SharedCatalog>;

    fn test_server() -> (TestServer, Arc<StaticDiscovery>, EventSink) {
        let discovery = Arc::new(StaticDiscovery::new());
        let events = EventSink::default();
        let server = TransportServer::new(
            TcpListenerFactory,
            Arc::clone(&discovery),
            Arc::new(SharedCatalog::in_memory()),
            events.clone(),
        );
        (server, discovery, events)
    }

    async fn wait_for_event(
        rx: &mut broadcast::Receiver<ShareEvent>,
        matches_fn: impl Fn(&ShareEvent) -> bool,
    ) -> ShareEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(ev) if matches_fn(&ev) => return ev,
                    Ok(_) => {}
                    Err(e) => panic!("event channel error: {e}"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn when_started_expect_port_bound_and_advertised() {
        let (server, discovery, _) = test_server();

        let port = server.start("127.0.0.1:0").await.unwrap();

        assert_ne!(port, 0);
        assert_eq!(discovery.advertised_port(), Some(port));
        assert_eq!(server.local_port().await, Some(port));
        server.stop().await;
    }

    #[tokio::test]
    async fn when_started_twice_expect_same_port() {
        let (server, _, _) = test_server();
        let first = server.start("127.0.0.1:0").await.unwrap();
        let second = server.start("127.0.0.1:0").await.unwrap();
        assert_eq!(first, second);
        server.stop().await;
    }

    #[tokio::test]
    async fn when_bind_fails_expect_transport_error() {
        let (server, discovery, _) = test_server();
        let result = server.start("not-an-address").await;
        assert!(matches!(result, Err(ShareError::Transport(_))));
        assert_eq!(discovery.advertised_port(), None);
        assert_eq!(server.local_port().await, None);
    }

    #[tokio::test]
    async fn when_advertise_fails_expect_transport_error_and_listener_released() {
        let (server, discovery, _) = test_server();
        discovery.fail_advertising(true);

        let result = server.start("127.0.0.1:0").await;

        assert!(matches!(result, Err(ShareError::Transport(_))));
        assert_eq!(server.local_port().await, None);
    }

    #[tokio::test]
    async fn when_stopped_expect_advertisement_withdrawn_and_idempotent() {
        let (server, discovery, _) = test_server();
        let port = server.start("127.0.0.1:0").await.unwrap();

        server.stop().await;
        server.stop().await;

        assert_eq!(discovery.advertised_port(), None);
        assert_eq!(server.local_port().await, None);
        assert!(TcpConnector.connect(LOCALHOST, port).await.is_err());
    }

    #[tokio::test]
    async fn when_client_connects_and_leaves_expect_connected_then_disconnected() {
        let (server, _, events) = test_server();
        let mut rx = events.subscribe();
        let port = server.start("127.0.0.1:0").await.unwrap();

        let mut conn = TcpConnector.connect(LOCALHOST, port).await.unwrap();
        wait_for_event(&mut rx, |e| matches!(e, ShareEvent::PeerConnected { .. })).await;
        write_message(&mut conn, &Message::Ping).await.unwrap();
        assert_eq!(read_message(&mut conn).await.unwrap(), Some(Message::Pong));
        assert_eq!(server.open_connections().len(), 1);

        drop(conn);
        let ev = wait_for_event(&mut rx, |e| matches!(e, ShareEvent::PeerDisconnected { .. })).await;
        let ShareEvent::PeerDisconnected { address, .. } = ev else {
            unreachable!();
        };
        assert_eq!(address, LOCALHOST);
        assert!(server.open_connections().is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn when_stopped_with_open_connection_expect_connection_closed() {
        let (server, _, events) = test_server();
        let mut rx = events.subscribe();
        let port = server.start("127.0.0.1:0").await.unwrap();

        let mut conn = TcpConnector.connect(LOCALHOST, port).await.unwrap();
        wait_for_event(&mut rx, |e| matches!(e, ShareEvent::PeerConnected { .. })).await;

        server.stop().await;

        wait_for_event(&mut rx, |e| matches!(e, ShareEvent::PeerDisconnected { .. })).await;
        let closed = tokio::time::timeout(Duration::from_secs(5), read_message(&mut conn))
            .await
            .unwrap();
        assert!(matches!(closed, Ok(None) | Err(_)));
    }

    #[tokio::test]
    async fn when_stopped_while_client_stalls_download_expect_connection_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("large.bin");
        std::fs::write(&path, vec![1u8; 32 * 1024 * 1024]).unwrap();
        let catalog = SharedCatalog::in_memory();
        catalog.add(&path).unwrap();
        let events = EventSink::default();
        let mut rx = events.subscribe();
        let server = TransportServer::new(
            TcpListenerFactory,
            Arc::new(StaticDiscovery::new()),
            Arc::new(catalog),
            events,
        );
        let port = server.start("127.0.0.1:0").await.unwrap();

        let mut conn = TcpConnector.connect(LOCALHOST, port).await.unwrap();
        write_message(&mut conn, &Message::FileRequest { filename: "large.bin".into() })
            .await
            .unwrap();
        wait_for_event(&mut rx, |e| matches!(e, ShareEvent::PeerConnected { .. })).await;
        // Never read, so the session ends up blocked on a full socket.
        tokio::time::sleep(Duration::from_millis(300)).await;

        server.stop().await;

        wait_for_event(&mut rx, |e| matches!(e, ShareEvent::PeerDisconnected { .. })).await;
        assert!(server.open_connections().is_empty());
        drop(conn);
    }

    #[tokio::test]
    async fn when_many_clients_connect_expect_each_served() {
        let (server, _, _) = test_server();
        let port = server.start("127.0.0.1:0").await.unwrap();

        let clients: Vec<_> = (0..8)
            .map(|_| {
                tokio::spawn(async move {
                    let mut conn = TcpConnector.connect(LOCALHOST, port).await.unwrap();
                    write_message(&mut conn, &Message::Ping).await.unwrap();
                    read_message(&mut conn).await.unwrap()
                })
            })
            .collect();
        for client in clients {
            assert_eq!(client.await.unwrap(), Some(Message::Pong));
        }
        server.stop().await;
    }
}
