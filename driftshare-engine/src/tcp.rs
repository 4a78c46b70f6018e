use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net;
use tracing::{debug, info};

use driftshare_core::transport::{Connection, Connector, Listener, ListenerFactory};

/// A TCP connection wrapping a [`tokio::net::TcpStream`].
pub struct TcpConnection {
    stream: net::TcpStream,
    peer_addr: SocketAddr,
}

impl TcpConnection {
    fn new(stream: net::TcpStream, peer_addr: SocketAddr) -> Self {
        // Request/response traffic: small frames should not wait for Nagle.
        let _ = stream.set_nodelay(true);
        Self { stream, peer_addr }
    }

    /// Returns a shared reference to the underlying stream.
    pub fn stream(&self) -> &net::TcpStream {
        &self.stream
    }
}

impl Connection for TcpConnection {
    fn peer(&self) -> String {
        self.peer_addr.ip().to_string()
    }

    fn peer_port(&self) -> u16 {
        self.peer_addr.port()
    }
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// A TCP listener wrapping a [`tokio::net::TcpListener`].
pub struct TcpListener {
    inner: net::TcpListener,
    local_addr: SocketAddr,
}

impl Listener for TcpListener {
    type Conn = TcpConnection;

    fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_ {
        async move {
            let (stream, addr) = self
                .inner
                .accept()
                .await
                .context("failed to accept TCP connection")?;
            debug!(peer = %addr, "Accepted TCP connection");
            Ok(TcpConnection::new(stream, addr))
        }
    }
}

/// Factory that binds [`TcpListener`] instances on the given address.
pub struct TcpListenerFactory;

impl ListenerFactory for TcpListenerFactory {
    type L = TcpListener;

    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a {
        async move {
            let inner = net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind TCP listener on {addr}"))?;
            let local_addr = inner
                .local_addr()
                .context("failed to retrieve local address")?;
            info!(addr = %local_addr, "TCP listener bound");
            Ok(TcpListener { inner, local_addr })
        }
    }
}

/// Opens outbound [`TcpConnection`]s.
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Conn = TcpConnection;

    fn connect<'a>(
        &'a self,
        address: &'a str,
        port: u16,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a {
        async move {
            let stream = net::TcpStream::connect((address, port))
                .await
                .with_context(|| format!("failed to connect to {address}:{port}"))?;
            let peer_addr = stream
                .peer_addr()
                .context("failed to retrieve peer address")?;
            debug!(peer = %peer_addr, "TCP connection established");
            Ok(TcpConnection::new(stream, peer_addr))
        }
    }
}
