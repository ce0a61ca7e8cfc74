//! Secure sessions over path-aware addresses.
//!
//! Dialing runs a fixed pipeline:
//!
//! 1. resolve the address (literal or through the resolver's host table)
//! 2. query paths to the destination domain
//! 3. build and initialize a per-session path selector
//! 4. bind a [`PathRoutedSocket`] and run the QUIC handshake
//!
//! The selector lives as long as the session. Its background work starts
//! only once the server has confirmed the handshake, so the handshake always
//! completes on the path chosen at initialization. It is stopped when the
//! session is closed or dropped locally, and when the peer closes it.
//!
//! Dialed sessions also re-query their destination's paths periodically and
//! whenever a known path expires, feeding the result to the selector.

use crate::conn::NetAddr;
use crate::error::{TransportError, TransportResult};
use crate::measure::{HandshakeProber, MEASURE_ALPN};
use crate::socket::{PathRoutedSocket, bind_udp, unspecified_for};
use crate::tls::{self, ClientTls, Credential, DEFAULT_ALPN};
use pathlink_core::{
    Address, AddressParser, ConfigError, IsdAs, Path, PathAddr, PathProber, PathResolver, PathSelector,
    SelectorPolicy, SelectorState,
};
use quinn::{Connection, ConnectionError, Endpoint, EndpointConfig, RecvStream, SendStream};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

/// Session tuning shared by dialers and listeners
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// ALPN protocols offered (client) or accepted (server)
    pub alpn: Vec<Vec<u8>>,
    /// Upper bound on the QUIC handshake
    pub handshake_timeout: Duration,
    /// Idle time after which a session is dropped
    pub idle_timeout: Duration,
    /// Keep-alive interval, if any
    pub keep_alive_interval: Option<Duration>,
    /// Path selection policy for dialed sessions
    pub selector: SelectorPolicy,
    /// Interval between path re-queries for dialed sessions.
    /// `None` re-queries only when a known path expires.
    pub path_refresh: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            alpn: vec![DEFAULT_ALPN.to_vec()],
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            keep_alive_interval: Some(Duration::from_secs(10)),
            selector: SelectorPolicy::Default,
            path_refresh: Some(Duration::from_secs(60)),
        }
    }
}

impl SessionConfig {
    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Config` for an invalid selector policy or a
    /// zero refresh interval, and `TransportError::Credential` for an empty
    /// or reserved ALPN list.
    pub fn validate(&self) -> TransportResult<()> {
        self.selector.validate()?;
        if self.path_refresh == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroRefreshInterval.into());
        }
        if self.alpn.is_empty() {
            return Err(TransportError::Credential(
                "at least one ALPN protocol is required".to_string(),
            ));
        }
        if self.alpn.iter().any(|p| p == MEASURE_ALPN) {
            return Err(TransportError::Credential(
                "the latency measurement protocol is reserved".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn transport_config(&self) -> TransportResult<quinn::TransportConfig> {
        let idle = quinn::IdleTimeout::try_from(self.idle_timeout).map_err(|_| {
            TransportError::Credential(format!("idle timeout {:?} too large", self.idle_timeout))
        })?;
        let mut transport = quinn::TransportConfig::default();
        transport.max_idle_timeout(Some(idle));
        transport.keep_alive_interval(self.keep_alive_interval);
        Ok(transport)
    }
}

/// Established QUIC session.
///
/// Dropping the session closes the connection and stops its selector.
pub struct SecureSession {
    connection: Connection,
    endpoint: Endpoint,
    selector: Option<Arc<dyn PathSelector>>,
    background: Vec<JoinHandle<()>>,
    local: NetAddr,
    remote: NetAddr,
}

impl SecureSession {
    fn new(
        connection: Connection,
        endpoint: Endpoint,
        selector: Option<Arc<dyn PathSelector>>,
        local: NetAddr,
        remote: NetAddr,
    ) -> Self {
        if let Some(selector) = &selector {
            watch_close(&connection, Arc::clone(selector));
        }
        Self {
            connection,
            endpoint,
            selector,
            background: Vec::new(),
            local,
            remote,
        }
    }

    /// Tie `task` to the session's lifetime
    fn own(&mut self, task: JoinHandle<()>) {
        self.background.push(task);
    }

    /// Open a bidirectional stream.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Stream` if the session is closed.
    pub async fn open_stream(&self) -> TransportResult<(SendStream, RecvStream)> {
        self.connection
            .open_bi()
            .await
            .map_err(|e| self.stream_error(e))
    }

    /// Wait for the peer to open a bidirectional stream.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Stream` if the session is closed.
    pub async fn accept_stream(&self) -> TransportResult<(SendStream, RecvStream)> {
        self.connection
            .accept_bi()
            .await
            .map_err(|e| self.stream_error(e))
    }

    fn stream_error(&self, e: ConnectionError) -> TransportError {
        TransportError::Stream {
            address: self.remote.to_string(),
            reason: e.to_string(),
        }
    }

    /// Close the connection and stop the selector. Idempotent.
    pub fn close(&self) {
        self.connection.close(0u32.into(), b"closed");
        for task in &self.background {
            task.abort();
        }
        if let Some(selector) = &self.selector {
            selector.close();
        }
    }

    /// Whether the connection has been closed by either side
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    /// Local address
    #[must_use]
    pub fn local_addr(&self) -> &NetAddr {
        &self.local
    }

    /// Remote address
    #[must_use]
    pub fn remote_addr(&self) -> &NetAddr {
        &self.remote
    }

    /// Path selector (dial side only)
    #[must_use]
    pub fn selector(&self) -> Option<&Arc<dyn PathSelector>> {
        self.selector.as_ref()
    }

    /// Path currently carrying the session (dial side only)
    #[must_use]
    pub fn path(&self) -> Option<Arc<Path>> {
        self.selector.as_ref().and_then(|s| s.path())
    }

    /// Smoothed round-trip time estimate
    #[must_use]
    pub fn rtt(&self) -> Duration {
        self.connection.rtt()
    }

    /// Negotiated ALPN protocol
    #[must_use]
    pub fn alpn(&self) -> Option<Vec<u8>> {
        negotiated_alpn(&self.connection)
    }

    /// Underlying endpoint
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for SecureSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("path", &self.path().map(|p| p.id.clone()))
            .finish_non_exhaustive()
    }
}

/// Stop `selector` once `connection` closes for any reason
fn watch_close(connection: &Connection, selector: Arc<dyn PathSelector>) {
    let connection = connection.clone();
    tokio::spawn(async move {
        let reason = connection.closed().await;
        tracing::debug!(remote = %connection.remote_address(), "session closed: {reason}");
        selector.close();
    });
}

fn negotiated_alpn(connection: &Connection) -> Option<Vec<u8>> {
    connection
        .handshake_data()
        .and_then(|data| data.downcast::<quinn::crypto::rustls::HandshakeData>().ok())
        .and_then(|data| data.protocol)
}

/// Interval between checks for handshake confirmation
const CONFIRM_POLL: Duration = Duration::from_millis(5);

/// Start `selector` once the server has confirmed the handshake.
///
/// Until then the server may still be waiting for our Finished on the
/// initial path; moving to another path before that loses the handshake.
async fn start_when_confirmed(
    connection: Connection,
    selector: Arc<dyn PathSelector>,
    limit: Duration,
) {
    let confirmed = async {
        while connection.stats().frame_rx.handshake_done == 0 {
            if connection.close_reason().is_some() {
                return false;
            }
            tokio::time::sleep(CONFIRM_POLL).await;
        }
        true
    };
    match tokio::time::timeout(limit, confirmed).await {
        Ok(true) => tracing::trace!("handshake confirmed"),
        Ok(false) => return,
        Err(_) => tracing::warn!(
            remote = %connection.remote_address(),
            "handshake not confirmed within {limit:?}; starting path selection anyway"
        ),
    }
    selector.start();
}

/// Added to path expiry times so a refresh never lands just before them
const EXPIRY_GRACE: Duration = Duration::from_millis(10);

/// Time until the next path refresh: the refresh interval or the earliest
/// future expiry among `paths`, whichever comes first
fn next_refresh(paths: &[Path], every: Option<Duration>) -> Option<Duration> {
    let now = SystemTime::now();
    let expiry = paths
        .iter()
        .filter_map(|p| p.metadata.expiry)
        .filter_map(|expiry| expiry.duration_since(now).ok())
        .min()
        .map(|left| left + EXPIRY_GRACE);
    match (every, expiry) {
        (Some(every), Some(expiry)) => Some(every.min(expiry)),
        (every, expiry) => every.or(expiry),
    }
}

/// Keep `selector` fed with fresh paths to `destination`
async fn refresh_paths(
    resolver: Arc<dyn PathResolver>,
    destination: IsdAs,
    selector: Arc<dyn PathSelector>,
    every: Option<Duration>,
    mut paths: Vec<Path>,
) {
    while let Some(wait) = next_refresh(&paths, every) {
        tokio::time::sleep(wait).await;
        if selector.state() == SelectorState::Stopped {
            return;
        }
        match resolver.query_paths(destination).await {
            Ok(fresh) if fresh.is_empty() => {
                tracing::warn!(%destination, "path refresh found no paths; keeping current set");
                paths.retain(|p| !p.is_expired());
            }
            Ok(fresh) => {
                tracing::debug!(%destination, count = fresh.len(), "paths refreshed");
                selector.refresh(fresh.clone());
                paths = fresh;
            }
            Err(e) => {
                tracing::warn!(%destination, "path refresh failed: {e}");
                paths.retain(|p| !p.is_expired());
            }
        }
    }
}

/// Bind an ephemeral UDP endpoint whose datagrams to `peer` follow the path
/// `selector` currently prefers.
pub(crate) fn routed_endpoint(
    peer: SocketAddr,
    selector: Arc<dyn PathSelector>,
) -> TransportResult<Endpoint> {
    let first_hop = selector.path().map_or(peer, |p| p.underlay_for(peer));
    let bind = unspecified_for(first_hop);
    let bind_error = |reason: String| TransportError::BindFailed {
        address: bind.to_string(),
        reason,
    };

    let std_socket = bind_udp(bind).map_err(|e| bind_error(e.to_string()))?;
    let runtime =
        quinn::default_runtime().ok_or_else(|| bind_error("no async runtime".to_string()))?;
    let inner = runtime
        .wrap_udp_socket(std_socket)
        .map_err(|e| bind_error(e.to_string()))?;
    let socket = Arc::new(PathRoutedSocket::new(inner, peer, selector));
    Endpoint::new_with_abstract_socket(EndpointConfig::default(), None, socket, runtime)
        .map_err(|e| bind_error(e.to_string()))
}

fn handshake_error(address: &PathAddr, timeout: Duration, e: ConnectionError) -> TransportError {
    match e {
        ConnectionError::TimedOut => TransportError::HandshakeTimeout {
            address: address.to_string(),
            timeout,
        },
        other => TransportError::HandshakeRejected {
            address: address.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Dials path-aware addresses
#[derive(Debug, Clone)]
pub struct Dialer {
    resolver: Arc<dyn PathResolver>,
    prober: Arc<dyn PathProber>,
    parser: AddressParser,
    tls: ClientTls,
    server_name: Option<String>,
    config: SessionConfig,
}

impl Dialer {
    /// Dialer with default settings, measuring path latency with
    /// [`HandshakeProber`]
    #[must_use]
    pub fn new(resolver: Arc<dyn PathResolver>, tls: ClientTls) -> Self {
        Self {
            resolver,
            prober: Arc::new(HandshakeProber::new()),
            parser: AddressParser::default(),
            tls,
            server_name: None,
            config: SessionConfig::default(),
        }
    }

    /// Use `prober` for active path probing
    #[must_use]
    pub fn with_prober(mut self, prober: Arc<dyn PathProber>) -> Self {
        self.prober = prober;
        self
    }

    /// Use `parser` for address parsing (default port)
    #[must_use]
    pub fn with_parser(mut self, parser: AddressParser) -> Self {
        self.parser = parser;
        self
    }

    /// Session configuration
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Name verified against the server certificate.
    /// Defaults to the remote host IP.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Address parser in use
    #[must_use]
    pub fn parser(&self) -> &AddressParser {
        &self.parser
    }

    /// Session configuration in use
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Resolve `address` and establish a session.
    ///
    /// # Errors
    ///
    /// `ResolutionFailed` or `NoPath` if the destination cannot be reached,
    /// `HandshakeTimeout` or `HandshakeRejected` if the QUIC handshake fails,
    /// `Config` for an invalid selector policy.
    pub async fn dial(&self, address: &str) -> TransportResult<SecureSession> {
        let remote = self
            .parser
            .resolve(self.resolver.as_ref(), address)
            .await
            .map_err(|e| TransportError::ResolutionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        tracing::debug!(%address, %remote, "resolved dial address");
        self.dial_addr(&remote).await
    }

    /// Establish a session with an already resolved address.
    ///
    /// # Errors
    ///
    /// See [`Dialer::dial`].
    pub async fn dial_addr(&self, remote: &PathAddr) -> TransportResult<SecureSession> {
        let paths = self.resolver.query_paths(remote.ia).await.map_err(|e| {
            TransportError::ResolutionFailed {
                address: remote.to_string(),
                reason: e.to_string(),
            }
        })?;
        if paths.is_empty() {
            return Err(TransportError::NoPath {
                address: remote.to_string(),
            });
        }
        tracing::debug!(%remote, count = paths.len(), "paths available");

        let selector = self.config.selector.build(Arc::clone(&self.prober))?;
        selector.initialize(remote, paths.clone());

        let mut session = match self.handshake(remote, Arc::clone(&selector)).await {
            Ok(session) => session,
            Err(e) => {
                selector.close();
                return Err(e);
            }
        };

        session.own(tokio::spawn(start_when_confirmed(
            session.connection.clone(),
            Arc::clone(&selector),
            self.config.handshake_timeout,
        )));
        session.own(tokio::spawn(refresh_paths(
            Arc::clone(&self.resolver),
            remote.ia,
            selector,
            self.config.path_refresh,
            paths,
        )));
        Ok(session)
    }

    async fn handshake(
        &self,
        remote: &PathAddr,
        selector: Arc<dyn PathSelector>,
    ) -> TransportResult<SecureSession> {
        if self.tls.is_insecure() {
            tracing::warn!(
                %remote,
                "certificate verification disabled; session can be intercepted on path"
            );
        }

        let peer = remote.socket_addr();
        let mut endpoint = routed_endpoint(peer, Arc::clone(&selector))?;
        endpoint.set_default_client_config(tls::client_config(&self.tls, &self.config)?);

        let server_name = self
            .server_name
            .clone()
            .unwrap_or_else(|| remote.host.to_string());
        let connecting =
            endpoint
                .connect(peer, &server_name)
                .map_err(|e| TransportError::HandshakeRejected {
                    address: remote.to_string(),
                    reason: e.to_string(),
                })?;

        let timeout = self.config.handshake_timeout;
        let connection = match tokio::time::timeout(timeout, connecting).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                endpoint.close(0u32.into(), b"handshake failed");
                return Err(handshake_error(remote, timeout, e));
            }
            Err(_) => {
                endpoint.close(0u32.into(), b"handshake timeout");
                return Err(TransportError::HandshakeTimeout {
                    address: remote.to_string(),
                    timeout,
                });
            }
        };

        let bound = endpoint
            .local_addr()
            .map_err(|e| TransportError::BindFailed {
                address: remote.to_string(),
                reason: e.to_string(),
            })?;
        let local = PathAddr::new(self.resolver.local_ia(), bound.ip(), bound.port());
        tracing::debug!(
            %remote,
            path = ?selector.path().map(|p| p.id.clone()),
            "session established"
        );

        Ok(SecureSession::new(
            connection,
            endpoint,
            Some(selector),
            NetAddr::Path(local),
            NetAddr::Path(remote.clone()),
        ))
    }
}

/// Accepts inbound sessions.
///
/// Handshakes run concurrently in the background; failed ones are logged
/// and skipped.
pub struct SessionListener {
    endpoint: Endpoint,
    local: PathAddr,
    sessions: Mutex<mpsc::Receiver<SecureSession>>,
    closed: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Sessions buffered between the handshake tasks and `accept`
const ACCEPT_BACKLOG: usize = 64;

impl SessionListener {
    /// Bind a listener.
    ///
    /// `address` is a path-aware literal (`ISD-AS,ip:port`) or a conventional
    /// `ip:port`; the latter listens in the wildcard domain `0-0`.
    ///
    /// # Errors
    ///
    /// `BindFailed` if the address is unusable or the socket cannot be
    /// bound; `Credential`/`Config` for bad TLS or session settings.
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
        let bind_error = |reason: String| TransportError::BindFailed {
            address: address.to_string(),
            reason,
        };
        let requested = match parser.classify(address).map_err(|e| bind_error(e.to_string()))? {
            Address::PathAware(addr) => addr,
            Address::Conventional { host, port } => {
                let ip: IpAddr = host
                    .parse()
                    .map_err(|_| bind_error(format!("{host:?} is not an IP literal")))?;
                PathAddr::new(IsdAs::default(), ip, port)
            }
        };

        config.validate()?;
        let server_config = tls::server_config(credential, &config)?;
        let socket = bind_udp(requested.socket_addr()).map_err(|e| bind_error(e.to_string()))?;
        let runtime =
            quinn::default_runtime().ok_or_else(|| bind_error("no async runtime".to_string()))?;
        let endpoint = Endpoint::new(
            EndpointConfig::default(),
            Some(server_config),
            socket,
            runtime,
        )
        .map_err(|e| bind_error(e.to_string()))?;

        let bound: SocketAddr = endpoint.local_addr().map_err(|e| bind_error(e.to_string()))?;
        let local = PathAddr {
            port: bound.port(),
            ..requested
        };
        tracing::info!(%local, "listening");

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (closed, _) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            endpoint.clone(),
            local.clone(),
            config.handshake_timeout,
            tx,
        ));

        Ok(Self {
            endpoint,
            local,
            sessions: Mutex::new(rx),
            closed,
            task,
        })
    }

    /// Wait for the next established session.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::AcceptError` once the listener is closed.
    pub async fn accept(&self) -> TransportResult<SecureSession> {
        let mut closed = self.closed_signal();
        if *closed.borrow() {
            return Err(self.closed_error());
        }

        let mut sessions = self.sessions.lock().await;
        tokio::select! {
            session = sessions.recv() => session.ok_or_else(|| self.closed_error()),
            _ = closed.wait_for(|c| *c) => Err(self.closed_error()),
        }
    }

    /// Flips to `true` once the listener is closed
    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub(crate) fn closed_error(&self) -> TransportError {
        TransportError::AcceptError {
            address: self.local.to_string(),
            reason: "listener closed".to_string(),
        }
    }

    /// Bound address
    #[must_use]
    pub fn local_addr(&self) -> &PathAddr {
        &self.local
    }

    /// Stop accepting new sessions. Established sessions stay open.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.endpoint.set_server_config(None);
        self.task.abort();
        tracing::debug!(local = %self.local, "listener closed");
    }
}

impl Drop for SessionListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for SessionListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionListener")
            .field("local", &self.local)
            .field("closed", &*self.closed.borrow())
            .finish_non_exhaustive()
    }
}

async fn accept_loop(
    endpoint: Endpoint,
    local: PathAddr,
    handshake_timeout: Duration,
    sessions: mpsc::Sender<SecureSession>,
) {
    while let Some(incoming) = endpoint.accept().await {
        let remote = incoming.remote_address();
        let endpoint = endpoint.clone();
        let local = local.clone();
        let sessions = sessions.clone();
        tokio::spawn(async move {
            let connecting = match incoming.accept() {
                Ok(connecting) => connecting,
                Err(e) => {
                    tracing::warn!(%remote, "refused inbound session: {e}");
                    return;
                }
            };
            let connection = match tokio::time::timeout(handshake_timeout, connecting).await {
                Ok(Ok(connection)) => connection,
                Ok(Err(e)) => {
                    tracing::warn!(%remote, "inbound handshake failed: {e}");
                    return;
                }
                Err(_) => {
                    tracing::warn!(%remote, "inbound handshake timed out");
                    return;
                }
            };
            if negotiated_alpn(&connection).as_deref() == Some(MEASURE_ALPN) {
                tracing::trace!(%remote, "latency measurement answered");
                connection.close(0u32.into(), b"measured");
                return;
            }
            tracing::debug!(%remote, "inbound session established");

            // The underlay does not carry the peer's domain
            let peer = PathAddr::new(IsdAs::default(), remote.ip(), remote.port());
            let session = SecureSession::new(
                connection,
                endpoint,
                None,
                NetAddr::Path(local),
                NetAddr::Path(peer),
            );
            if sessions.send(session).await.is_err() {
                tracing::debug!(%remote, "listener gone; dropping session");
            }
        });
    }
    tracing::debug!(%local, "endpoint stopped accepting");
}
