//! Plain TCP behind the same [`Conn`]/[`Listener`] interfaces.

use crate::conn::{Conn, Deadline, Listener, NetAddr};
use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;

/// TCP connection with deadlines
#[derive(Debug)]
pub struct TcpConn {
    stream: TcpStream,
    local: SocketAddr,
    remote: SocketAddr,
    read_deadline: Deadline,
    write_deadline: Deadline,
}

impl TcpConn {
    /// Connect to a conventional `host:port` address.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::HandshakeRejected` if the connection fails.
    pub async fn connect(address: &str) -> TransportResult<Self> {
        let stream =
            TcpStream::connect(address)
                .await
                .map_err(|e| TransportError::HandshakeRejected {
                    address: address.to_string(),
                    reason: e.to_string(),
                })?;
        Self::from_stream(stream).map_err(TransportError::from)
    }

    /// Wrap a connected stream
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket has no addresses.
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            local: stream.local_addr()?,
            remote: stream.peer_addr()?,
            stream,
            read_deadline: Deadline::default(),
            write_deadline: Deadline::default(),
        })
    }
}

impl AsyncRead for TcpConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(e) = this.read_deadline.poll_expired(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(e) = this.write_deadline.poll_expired(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[async_trait]
impl Conn for TcpConn {
    fn local_addr(&self) -> NetAddr {
        NetAddr::Tcp(self.local)
    }

    fn remote_addr(&self) -> NetAddr {
        NetAddr::Tcp(self.remote)
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline.set(deadline);
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline.set(deadline);
    }

    async fn close(&mut self) -> io::Result<()> {
        match self.stream.shutdown().await {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

/// TCP listener.
///
/// The socket stays bound until the listener is dropped; `close` only stops
/// `accept`.
#[derive(Debug)]
pub struct TcpStreamListener {
    listener: TcpListener,
    local: SocketAddr,
    closed: watch::Sender<bool>,
}

impl TcpStreamListener {
    /// Bind to a conventional `host:port` address.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::BindFailed` if the address cannot be bound.
    pub async fn bind(address: &str) -> TransportResult<Self> {
        let bind_error = |e: io::Error| TransportError::BindFailed {
            address: address.to_string(),
            reason: e.to_string(),
        };
        let listener = TcpListener::bind(address).await.map_err(bind_error)?;
        let local = listener.local_addr().map_err(bind_error)?;
        tracing::info!(%local, "listening (tcp)");
        let (closed, _) = watch::channel(false);
        Ok(Self {
            listener,
            local,
            closed,
        })
    }
}

#[async_trait]
impl Listener for TcpStreamListener {
    async fn accept(&self) -> TransportResult<Box<dyn Conn>> {
        let accept_error = |reason: String| TransportError::AcceptError {
            address: self.local.to_string(),
            reason,
        };
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(accept_error("listener closed".to_string()));
        }
        tokio::select! {
            accepted = self.listener.accept() => {
                let (stream, peer) = accepted.map_err(|e| accept_error(e.to_string()))?;
                tracing::debug!(%peer, "accepted tcp connection");
                let conn = TcpConn::from_stream(stream).map_err(|e| accept_error(e.to_string()))?;
                Ok(Box::new(conn) as Box<dyn Conn>)
            }
            _ = closed.wait_for(|c| *c) => Err(accept_error("listener closed".to_string())),
        }
    }

    fn local_addr(&self) -> NetAddr {
        NetAddr::Tcp(self.local)
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_tcp_echo() {
        let listener = TcpStreamListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        assert_eq!(addr.network(), "tcp");

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
            conn.close().await.unwrap();
        });

        let mut conn = TcpConn::connect(&addr.to_string()).await.unwrap();
        assert_eq!(conn.remote_addr(), addr);
        conn.write_all(b"hello").await.unwrap();
        let mut reply = [0u8; 5];
        conn.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let listener = TcpStreamListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().to_string();
        let server = tokio::spawn(async move { listener.accept().await.unwrap() });

        let mut conn = TcpConn::connect(&addr).await.unwrap();
        let _peer = server.await.unwrap();

        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));
        let mut buf = [0u8; 1];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        // Still expired until reset
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        conn.set_read_deadline(None);
    }

    #[tokio::test]
    async fn test_accept_after_close() {
        let listener = TcpStreamListener::bind("127.0.0.1:0").await.unwrap();
        listener.close().await;
        let err = listener.accept().await.err().unwrap();
        assert!(matches!(err, TransportError::AcceptError { .. }));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let err = TcpConn::connect(&format!("127.0.0.1:{port}")).await.unwrap_err();
        assert!(matches!(err, TransportError::HandshakeRejected { .. }));
    }
}
