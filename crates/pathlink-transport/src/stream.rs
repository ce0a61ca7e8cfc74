//! One bidirectional byte stream per session.
//!
//! QUIC streams become visible to the peer only once data is sent on them,
//! so the dialing side writes a single [`OPEN_MARKER`] byte right after
//! opening; the accepting side consumes it before handing the stream out.

use crate::conn::{Conn, Deadline, Listener, NetAddr};
use crate::error::{TransportError, TransportResult};
use crate::session::{SecureSession, SessionConfig, SessionListener};
use crate::tls::Credential;
use async_trait::async_trait;
use pathlink_core::AddressParser;
use quinn::{RecvStream, SendStream};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// First byte on every stream, written by the dialer
pub const OPEN_MARKER: u8 = 0x01;

/// Upper bound on waiting for the peer to acknowledge a finished stream
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// Byte stream bound to one [`SecureSession`]
#[derive(Debug)]
pub struct StreamConn {
    send: SendStream,
    recv: RecvStream,
    read_deadline: Deadline,
    write_deadline: Deadline,
    closed: bool,
    session: SecureSession,
}

impl StreamConn {
    /// Open the session's stream and announce it to the peer.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Stream` if the session is already closed.
    pub async fn dial(session: SecureSession) -> TransportResult<Self> {
        let (mut send, recv) = session.open_stream().await?;
        send.write_all(&[OPEN_MARKER])
            .await
            .map_err(|e| TransportError::Stream {
                address: session.remote_addr().to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::new(session, send, recv))
    }

    /// Accept the stream the peer opened on `session`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Stream` if the session closes first or the
    /// peer does not start with the open marker.
    pub async fn accept(session: SecureSession) -> TransportResult<Self> {
        let (send, mut recv) = session.accept_stream().await?;
        let stream_error = |reason: String| TransportError::Stream {
            address: session.remote_addr().to_string(),
            reason,
        };
        let mut marker = [0u8; 1];
        recv.read_exact(&mut marker)
            .await
            .map_err(|e| stream_error(e.to_string()))?;
        if marker[0] != OPEN_MARKER {
            return Err(stream_error(format!("unexpected open marker {:#04x}", marker[0])));
        }
        Ok(Self::new(session, send, recv))
    }

    fn new(session: SecureSession, send: SendStream, recv: RecvStream) -> Self {
        Self {
            send,
            recv,
            read_deadline: Deadline::default(),
            write_deadline: Deadline::default(),
            closed: false,
            session,
        }
    }

    /// Session carrying the stream
    #[must_use]
    pub fn session(&self) -> &SecureSession {
        &self.session
    }
}

impl AsyncRead for StreamConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(e) = this.read_deadline.poll_expired(cx) {
            return Poll::Ready(Err(e));
        }
        AsyncRead::poll_read(Pin::new(&mut this.recv), cx, buf)
    }
}

impl AsyncWrite for StreamConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(e) = this.write_deadline.poll_expired(cx) {
            return Poll::Ready(Err(e));
        }
        AsyncWrite::poll_write(Pin::new(&mut this.send), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().send), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().send), cx)
    }
}

#[async_trait]
impl Conn for StreamConn {
    fn local_addr(&self) -> NetAddr {
        self.session.local_addr().clone()
    }

    fn remote_addr(&self) -> NetAddr {
        self.session.remote_addr().clone()
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline.set(deadline);
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline.set(deadline);
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // Already finished by a shutdown is fine
        let _ = self.send.finish();
        // Let queued data reach the peer before the connection goes away
        let _ = tokio::time::timeout(CLOSE_LINGER, self.send.stopped()).await;
        self.session.close();
        tracing::debug!(remote = %self.session.remote_addr(), "stream closed");
        Ok(())
    }
}

/// Streams buffered between the per-session tasks and `accept_stream`
const STREAM_BACKLOG: usize = 64;

/// Listener handing out one [`StreamConn`] per inbound session.
///
/// Each session waits for its stream in its own task, so a peer that never
/// opens one does not hold up the others.
#[derive(Debug)]
pub struct StreamListener {
    sessions: Arc<SessionListener>,
    streams: Mutex<mpsc::Receiver<StreamConn>>,
    task: JoinHandle<()>,
}

impl StreamListener {
    /// Bind on `address` presenting `credential`.
    ///
    /// # Errors
    ///
    /// See [`SessionListener::bind`].
    pub fn bind(
        address: &str,
        credential: &Credential,
        config: SessionConfig,
    ) -> TransportResult<Self> {
        Self::bind_with_parser(&AddressParser::default(), address, credential, config)
    }

    /// Bind using `parser` for the address.
    ///
    /// # Errors
    ///
    /// See [`SessionListener::bind`].
    pub fn bind_with_parser(
        parser: &AddressParser,
        address: &str,
        credential: &Credential,
        config: SessionConfig,
    ) -> TransportResult<Self> {
        let stream_timeout = config.handshake_timeout;
        let sessions = Arc::new(SessionListener::bind_with_parser(
            parser, address, credential, config,
        )?);
        let (tx, rx) = mpsc::channel(STREAM_BACKLOG);
        let task = tokio::spawn(open_streams(Arc::clone(&sessions), stream_timeout, tx));
        Ok(Self {
            sessions,
            streams: Mutex::new(rx),
            task,
        })
    }

    /// Wait for a session and its stream.
    ///
    /// Sessions that never open a stream within the handshake timeout are
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::AcceptError` once the listener is closed.
    pub async fn accept_stream(&self) -> TransportResult<StreamConn> {
        let mut closed = self.sessions.closed_signal();
        if *closed.borrow() {
            return Err(self.sessions.closed_error());
        }

        let mut streams = self.streams.lock().await;
        tokio::select! {
            conn = streams.recv() => conn.ok_or_else(|| self.sessions.closed_error()),
            _ = closed.wait_for(|c| *c) => Err(self.sessions.closed_error()),
        }
    }

    /// Session listener underneath
    #[must_use]
    pub fn sessions(&self) -> &SessionListener {
        &self.sessions
    }
}

impl Drop for StreamListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn open_streams(
    sessions: Arc<SessionListener>,
    stream_timeout: Duration,
    streams: mpsc::Sender<StreamConn>,
) {
    while let Ok(session) = sessions.accept().await {
        let streams = streams.clone();
        tokio::spawn(async move {
            let remote = session.remote_addr().clone();
            match tokio::time::timeout(stream_timeout, StreamConn::accept(session)).await {
                Ok(Ok(conn)) => {
                    if streams.send(conn).await.is_err() {
                        tracing::debug!(%remote, "listener gone; dropping stream");
                    }
                }
                Ok(Err(e)) => tracing::warn!(%remote, "skipping session: {e}"),
                Err(_) => tracing::warn!(%remote, "skipping session: no stream opened"),
            }
        });
    }
}

#[async_trait]
impl Listener for StreamListener {
    async fn accept(&self) -> TransportResult<Box<dyn Conn>> {
        Ok(Box::new(self.accept_stream().await?))
    }

    fn local_addr(&self) -> NetAddr {
        NetAddr::Path(self.sessions.local_addr().clone())
    }

    async fn close(&self) {
        self.sessions.close();
    }
}
