//! # Pathlink Transport
//!
//! Session and stream layer for Pathlink.
//!
//! This crate provides:
//! - QUIC sessions dialed over path-aware addresses, routed through the
//!   path a per-session selector currently prefers
//! - A listener accepting inbound sessions and answering latency
//!   measurements
//! - Handshake-timed path latency measurement for active path selection
//! - A single-stream adapter exposing each session as a byte stream
//! - Plain TCP behind the same `Conn`/`Listener` traits, and a dispatcher
//!   choosing between the two by address

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conn;
pub mod error;
pub mod measure;
pub mod net;
pub mod session;
pub mod socket;
pub mod stream;
pub mod tcp;
pub mod tls;

pub use conn::{Conn, Listener, NetAddr};
pub use error::{TransportError, TransportResult};
pub use measure::{HandshakeProber, MEASURE_ALPN};
pub use net::Network;
pub use session::{Dialer, SecureSession, SessionConfig, SessionListener};
pub use socket::PathRoutedSocket;
pub use stream::{StreamConn, StreamListener};
pub use tcp::{TcpConn, TcpStreamListener};
pub use tls::{ClientTls, Credential, DEFAULT_ALPN};
