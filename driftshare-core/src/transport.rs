use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

/// A transport-agnostic byte stream between two endpoints.
///
/// The protocol code reads and writes through the tokio I/O traits and only
/// asks the connection who is on the other end, so the server and client work
/// the same over TCP, an RFCOMM socket, or an in-memory pipe.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Transport address of the remote end (e.g. `"192.168.1.7"` or a
    /// Bluetooth device address), without the port.
    fn peer(&self) -> String;

    /// Port (or channel) of the remote end.
    fn peer_port(&self) -> u16;
}

/// An async listener that accepts incoming [`Connection`]s.
pub trait Listener: Send + 'static {
    /// The concrete connection type produced by [`accept`](Listener::accept).
    type Conn: Connection;

    /// Returns the local port the listener is bound to.
    fn local_port(&self) -> u16;

    /// Waits for and accepts the next inbound connection.
    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_;
}

/// Factory for creating [`Listener`] instances.
///
/// Separating creation from usage keeps the server generic: pass a
/// TCP factory in production and a fake in tests.
pub trait ListenerFactory: Send + Sync + 'static {
    /// The concrete listener type produced by [`bind`](ListenerFactory::bind).
    type L: Listener;

    /// Binds a new listener to the given address.
    ///
    /// Use `"<ip>:0"` to let the OS assign an available port.
    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a;
}

/// Factory for creating outbound [`Connection`]s (client side).
pub trait Connector: Send + Sync + 'static {
    /// The concrete connection type produced by [`connect`](Connector::connect).
    type Conn: Connection;

    /// Opens a new outbound connection to `port` on the device at `address`.
    fn connect<'a>(
        &'a self,
        address: &'a str,
        port: u16,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a;
}

/// A nearby device reported by [`ServiceDiscovery::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: String,
    /// Friendly name, when the transport could look one up.
    pub name: Option<String>,
}

/// The transport's discovery capability: finding devices, looking up the
/// port a service listens on, and publishing our own service.
pub trait ServiceDiscovery: Send + Sync + 'static {
    /// Scans for nearby devices for at most `duration`.
    fn scan(
        &self,
        duration: Duration,
    ) -> impl Future<Output = anyhow::Result<Vec<DiscoveredDevice>>> + Send + '_;

    /// Looks up `service_id` on the device at `address`.
    ///
    /// Returns `Ok(None)` when the device is reachable but does not offer
    /// the service.
    fn find_service<'a>(
        &'a self,
        service_id: &'a str,
        address: &'a str,
    ) -> impl Future<Output = anyhow::Result<Option<u16>>> + Send + 'a;

    /// Publishes `service_id` as listening on `port`.
    fn advertise<'a>(
        &'a self,
        service_id: &'a str,
        port: u16,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a;

    /// Withdraws the advertisement published by [`advertise`](ServiceDiscovery::advertise).
    fn stop_advertising(&self) -> impl Future<Output = anyhow::Result<()>> + Send + '_;
}
