//! Generic stream connection and listener interfaces.

use crate::error::TransportResult;
use async_trait::async_trait;
use pathlink_core::PathAddr;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Instant, Sleep};

/// Network name reported for path-aware addresses
pub const PATH_NETWORK: &str = "scion";

/// Network name reported for TCP addresses
pub const TCP_NETWORK: &str = "tcp";

/// Endpoint address of a connection
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NetAddr {
    /// Plain TCP
    Tcp(SocketAddr),
    /// Path-aware
    Path(PathAddr),
}

impl NetAddr {
    /// Network the address belongs to
    #[must_use]
    pub fn network(&self) -> &'static str {
        match self {
            Self::Tcp(_) => TCP_NETWORK,
            Self::Path(_) => PATH_NETWORK,
        }
    }

    /// Underlay socket address
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        match self {
            Self::Tcp(addr) => *addr,
            Self::Path(addr) => addr.socket_addr(),
        }
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => addr.fmt(f),
            Self::Path(addr) => addr.fmt(f),
        }
    }
}

/// Bidirectional byte stream with deadlines.
///
/// A deadline is an absolute instant; once it passes, pending and future
/// I/O in that direction fails with [`io::ErrorKind::TimedOut`] until the
/// deadline is moved or cleared with `None`.
#[async_trait]
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {
    /// Local address
    fn local_addr(&self) -> NetAddr;

    /// Remote address
    fn remote_addr(&self) -> NetAddr;

    /// Set both read and write deadlines
    fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Set the read deadline
    fn set_read_deadline(&mut self, deadline: Option<Instant>);

    /// Set the write deadline
    fn set_write_deadline(&mut self, deadline: Option<Instant>);

    /// Flush, then release the connection and everything it owns
    async fn close(&mut self) -> io::Result<()>;
}

/// Source of inbound connections
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next connection.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::AcceptError` once the listener is closed.
    async fn accept(&self) -> TransportResult<Box<dyn Conn>>;

    /// Bound address
    fn local_addr(&self) -> NetAddr;

    /// Stop accepting. Established connections are unaffected.
    async fn close(&self);
}

/// One-direction I/O deadline
#[derive(Default)]
pub(crate) struct Deadline {
    timer: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
    pub(crate) fn set(&mut self, deadline: Option<Instant>) {
        self.timer = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
    }

    /// Ready with an error once the deadline has passed
    pub(crate) fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        let Some(timer) = self.timer.as_mut() else {
            return Poll::Pending;
        };
        match timer.as_mut().poll(cx) {
            Poll::Ready(()) => {
                Poll::Ready(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Deadline")
            .field(&self.timer.as_ref().map(|t| t.deadline()))
            .finish()
    }
}
