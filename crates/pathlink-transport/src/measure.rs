//! Path latency measured with short QUIC handshakes.
//!
//! Each measurement binds an ephemeral endpoint pinned to one path and
//! handshakes with the remote listener offering only [`MEASURE_ALPN`].
//! Listeners accept that protocol on top of their configured ones and close
//! such connections as soon as they are established. The handshake time is
//! the path's latency; a path whose handshake fails is unreachable.

use crate::session::{SessionConfig, routed_endpoint};
use crate::tls::{self, ClientTls};
use async_trait::async_trait;
use pathlink_core::{DefaultSelector, Path, PathAddr, PathProber, PathSelector, ProbeError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// ALPN protocol reserved for latency measurements
pub const MEASURE_ALPN: &[u8] = b"pathlink-measure";

/// Measures a path by timing a QUIC handshake over it.
///
/// Certificates are not verified: nothing is exchanged on the connection
/// and it is closed right after the handshake.
#[derive(Clone, Debug)]
pub struct HandshakeProber {
    config: SessionConfig,
}

impl HandshakeProber {
    /// Prober with default transport settings
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: SessionConfig {
                alpn: vec![MEASURE_ALPN.to_vec()],
                keep_alive_interval: None,
                ..SessionConfig::default()
            },
        }
    }
}

impl Default for HandshakeProber {
    fn default() -> Self {
        Self::new()
    }
}

fn unreachable(e: impl ToString) -> ProbeError {
    ProbeError::Unreachable(e.to_string())
}

#[async_trait]
impl PathProber for HandshakeProber {
    async fn probe(&self, remote: &PathAddr, path: &Path) -> Result<Duration, ProbeError> {
        if path.is_expired() {
            return Err(ProbeError::Expired);
        }

        let peer = remote.socket_addr();
        let pinned = Arc::new(DefaultSelector::new());
        pinned.initialize(remote, vec![path.clone()]);
        let mut endpoint = routed_endpoint(peer, pinned).map_err(unreachable)?;
        endpoint.set_default_client_config(
            tls::client_config(&ClientTls::InsecureSkipVerify, &self.config)
                .map_err(unreachable)?,
        );

        let started = Instant::now();
        let result = match endpoint.connect(peer, &remote.host.to_string()) {
            Ok(connecting) => connecting.await.map_err(unreachable),
            Err(e) => Err(unreachable(e)),
        };
        let elapsed = started.elapsed();

        if let Ok(connection) = &result {
            connection.close(0u32.into(), b"measured");
        }
        endpoint.close(0u32.into(), b"measured");
        tracing::trace!(%remote, path = %path.id, ?elapsed, ok = result.is_ok(), "path measured");
        result.map(|_| elapsed)
    }
}
