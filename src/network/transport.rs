//! Datagram Transport
//!
//! Object-safe socket abstraction so the channel, the room host and the
//! session can run over tokio UDP in production and over instrumented
//! sockets in tests.

use std::io;
use std::net::SocketAddr;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::net::UdpSocket;

/// An unreliable datagram socket.
pub trait DatagramSocket: Send + Sync {
    /// Send one datagram.
    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> BoxFuture<'a, io::Result<usize>>;

    /// Wait for one datagram.
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<(usize, SocketAddr)>>;

    /// Address the socket is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Release the socket. Further sends and receives fail.
    fn close(&mut self) -> io::Result<()>;
}

/// Creates bound sockets.
pub trait SocketBinder: Send + Sync {
    /// Bind a datagram socket to `addr`.
    fn bind(&self, addr: SocketAddr) -> BoxFuture<'_, io::Result<Box<dyn DatagramSocket>>>;
}

/// Tokio UDP socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    /// Bind a UDP socket.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket))
    }

    /// Wrap an existing socket.
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self { socket: Some(socket) }
    }

    fn inner(&self) -> io::Result<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket closed"))
    }
}

impl DatagramSocket for UdpTransport {
    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> BoxFuture<'a, io::Result<usize>> {
        async move { self.inner()?.send_to(buf, target).await }.boxed()
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<(usize, SocketAddr)>> {
        async move { self.inner()?.recv_from(buf).await }.boxed()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner()?.local_addr()
    }

    fn close(&mut self) -> io::Result<()> {
        // Dropping the tokio socket closes the descriptor
        self.socket.take();
        Ok(())
    }
}

/// Binds [`UdpTransport`] sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpBinder;

impl SocketBinder for UdpBinder {
    fn bind(&self, addr: SocketAddr) -> BoxFuture<'_, io::Result<Box<dyn DatagramSocket>>> {
        async move {
            let socket = UdpTransport::bind(addr).await?;
            Ok::<_, io::Error>(Box::new(socket) as Box<dyn DatagramSocket>)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral() {
        let socket = UdpBinder.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = socket.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_send_recv() {
        let server = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let client = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        client.send_to(b"ping", server.local_addr().unwrap()).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_closed_socket_fails() {
        let mut socket = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        socket.close().unwrap();
        // Idempotent
        socket.close().unwrap();

        assert!(socket.local_addr().is_err());
        let err = socket
            .send_to(b"x", "127.0.0.1:9".parse().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
