//! Address-agnostic dial and listen.
//!
//! Path-aware literals (`ISD-AS,host:port`) go over QUIC sessions; every
//! other address goes over plain TCP.

use crate::conn::{Conn, Listener};
use crate::error::TransportResult;
use crate::session::Dialer;
use crate::stream::{StreamConn, StreamListener};
use crate::tcp::{TcpConn, TcpStreamListener};
use crate::tls::Credential;
use pathlink_core::Address;

/// Dial/listen entry point choosing the transport from the address
#[derive(Debug, Clone)]
pub struct Network {
    dialer: Dialer,
    credential: Credential,
}

impl Network {
    /// Dial with `dialer`; listen presenting `credential`
    #[must_use]
    pub fn new(dialer: Dialer, credential: Credential) -> Self {
        Self { dialer, credential }
    }

    /// Whether `address` is served by the path-aware stack
    #[must_use]
    pub fn is_path_aware(&self, address: &str) -> bool {
        matches!(
            self.dialer.parser().classify(address),
            Ok(Address::PathAware(_))
        )
    }

    /// Connect to `address`.
    ///
    /// # Errors
    ///
    /// Any dial error of the selected transport.
    pub async fn dial(&self, address: &str) -> TransportResult<Box<dyn Conn>> {
        if self.is_path_aware(address) {
            let session = self.dialer.dial(address).await?;
            Ok(Box::new(StreamConn::dial(session).await?))
        } else {
            tracing::debug!(%address, "dialing over tcp");
            Ok(Box::new(TcpConn::connect(address).await?))
        }
    }

    /// Listen on `address`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::BindFailed` if the address cannot be bound.
    pub async fn listen(&self, address: &str) -> TransportResult<Box<dyn Listener>> {
        if self.is_path_aware(address) {
            Ok(Box::new(StreamListener::bind_with_parser(
                self.dialer.parser(),
                address,
                &self.credential,
                self.dialer.config().clone(),
            )?))
        } else {
            Ok(Box::new(TcpStreamListener::bind(address).await?))
        }
    }
}
