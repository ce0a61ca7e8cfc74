//! Transport errors.

use pathlink_core::ConfigError;
use std::io;
use std::time::Duration;

/// Session and stream errors.
///
/// Every network-facing variant names the address that was being dialed,
/// bound or served.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Address could not be parsed, resolved, or routed
    #[error("failed to resolve {address}: {reason}")]
    ResolutionFailed {
        /// Address being dialed
        address: String,
        /// Underlying cause
        reason: String,
    },

    /// Resolver knows no path to the destination
    #[error("no path to {address}")]
    NoPath {
        /// Resolved destination
        address: String,
    },

    /// Handshake did not complete in time
    #[error("handshake with {address} timed out after {timeout:?}")]
    HandshakeTimeout {
        /// Remote address
        address: String,
        /// Configured handshake timeout
        timeout: Duration,
    },

    /// Peer refused the session (TLS, ALPN, or transport close)
    #[error("handshake with {address} rejected: {reason}")]
    HandshakeRejected {
        /// Remote address
        address: String,
        /// Reason reported by the QUIC stack
        reason: String,
    },

    /// Local socket could not be bound
    #[error("failed to bind {address}: {reason}")]
    BindFailed {
        /// Bind address
        address: String,
        /// Underlying cause
        reason: String,
    },

    /// Listener is closed or its endpoint failed
    #[error("accept on {address} failed: {reason}")]
    AcceptError {
        /// Listener address
        address: String,
        /// Underlying cause
        reason: String,
    },

    /// Stream could not be opened or accepted on an established session
    #[error("stream with {address} failed: {reason}")]
    Stream {
        /// Remote address
        address: String,
        /// Underlying cause
        reason: String,
    },

    /// Certificate or key material is unusable
    #[error("credential error: {0}")]
    Credential(String),

    /// Invalid selector or session configuration
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

impl TransportError {
    /// Whether the error happened before a session existed
    #[must_use]
    pub fn is_dial_failure(&self) -> bool {
        matches!(
            self,
            Self::ResolutionFailed { .. }
                | Self::NoPath { .. }
                | Self::HandshakeTimeout { .. }
                | Self::HandshakeRejected { .. }
        )
    }
}

impl From<TransportError> for io::Error {
    fn from(err: TransportError) -> Self {
        let kind = match &err {
            TransportError::Io(e) => e.kind(),
            TransportError::HandshakeTimeout { .. } => io::ErrorKind::TimedOut,
            TransportError::HandshakeRejected { .. } => io::ErrorKind::ConnectionRefused,
            TransportError::BindFailed { .. } => io::ErrorKind::AddrNotAvailable,
            TransportError::ResolutionFailed { .. } | TransportError::NoPath { .. } => {
                io::ErrorKind::NotFound
            }
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
