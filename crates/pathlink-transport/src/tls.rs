//! TLS credentials and QUIC crypto configuration.
//!
//! Both sides speak TLS 1.3 only, with the `ring` provider. Servers present a
//! [`Credential`]; clients either verify against explicit roots or, when
//! opted into [`ClientTls::InsecureSkipVerify`], accept any certificate.

use crate::error::{TransportError, TransportResult};
use crate::measure::MEASURE_ALPN;
use crate::session::SessionConfig;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// ALPN protocol offered and required by default
pub const DEFAULT_ALPN: &[u8] = b"hello-quic";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Certificate chain and private key presented by a listener
pub struct Credential {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Credential {
    /// Wrap DER-encoded material.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Credential` for an empty chain.
    pub fn from_der(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> TransportResult<Self> {
        if chain.is_empty() {
            return Err(TransportError::Credential(
                "certificate chain is empty".to_string(),
            ));
        }
        Ok(Self { chain, key })
    }

    /// Fresh self-signed certificate for `names` (DNS names or IP literals).
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Credential` if generation fails.
    pub fn self_signed<I, S>(names: I) -> TransportResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let certified = rcgen::generate_simple_self_signed(names)
            .map_err(|e| TransportError::Credential(e.to_string()))?;
        let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
        Self::from_der(vec![certified.cert.der().clone()], PrivateKeyDer::Pkcs8(key))
    }

    /// Load a PEM certificate chain and private key.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Credential` if either file is unreadable.
    pub fn from_pem_files(cert: &Path, key: &Path) -> TransportResult<Self> {
        let chain = load_certificates(cert)?;
        let key = PrivateKeyDer::from_pem_file(key)
            .map_err(|e| TransportError::Credential(format!("{}: {e}", key.display())))?;
        Self::from_der(chain, key)
    }

    /// Certificate chain, leaf first
    #[must_use]
    pub fn certificate_chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }
}

impl Clone for Credential {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// Read every certificate in a PEM file.
///
/// # Errors
///
/// Returns `TransportError::Credential` if the file is unreadable or holds no
/// certificate.
pub fn load_certificates(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
        .map_err(|e| TransportError::Credential(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(TransportError::Credential(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

/// Client-side certificate policy
#[derive(Clone, Debug)]
pub enum ClientTls {
    /// Verify the server against these trust anchors
    Verified {
        /// Trusted root certificates
        roots: Vec<CertificateDer<'static>>,
    },
    /// Accept any server certificate.
    ///
    /// The session is encrypted but unauthenticated: an on-path attacker can
    /// impersonate the server.
    InsecureSkipVerify,
}

impl ClientTls {
    /// Trust the certificates of `credential` as roots
    #[must_use]
    pub fn trusting(credential: &Credential) -> Self {
        Self::Verified {
            roots: credential.certificate_chain().to_vec(),
        }
    }

    /// Whether certificate verification is disabled
    #[must_use]
    pub fn is_insecure(&self) -> bool {
        matches!(self, Self::InsecureSkipVerify)
    }
}

#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn tls_error(e: impl fmt::Display) -> TransportError {
    TransportError::Credential(e.to_string())
}

/// QUIC client configuration for `tls` and `config`
pub(crate) fn client_config(
    tls: &ClientTls,
    config: &SessionConfig,
) -> TransportResult<quinn::ClientConfig> {
    let provider = provider();
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_error)?;

    let mut crypto = match tls {
        ClientTls::Verified { roots } => {
            let mut store = RootCertStore::empty();
            for root in roots {
                store.add(root.clone()).map_err(tls_error)?;
            }
            builder.with_root_certificates(store).with_no_client_auth()
        }
        ClientTls::InsecureSkipVerify => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
            .with_no_client_auth(),
    };
    crypto.alpn_protocols = config.alpn.clone();

    let quic = QuicClientConfig::try_from(crypto).map_err(tls_error)?;
    let mut client = quinn::ClientConfig::new(Arc::new(quic));
    client.transport_config(Arc::new(config.transport_config()?));
    Ok(client)
}

/// QUIC server configuration presenting `credential`.
///
/// Also accepts [`MEASURE_ALPN`].
pub(crate) fn server_config(
    credential: &Credential,
    config: &SessionConfig,
) -> TransportResult<quinn::ServerConfig> {
    let mut crypto = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_error)?
        .with_no_client_auth()
        .with_single_cert(credential.chain.clone(), credential.key.clone_key())
        .map_err(tls_error)?;
    // Latency measurements are answered alongside the configured protocols
    crypto.alpn_protocols = config.alpn.clone();
    crypto.alpn_protocols.push(MEASURE_ALPN.to_vec());

    let quic = QuicServerConfig::try_from(crypto).map_err(tls_error)?;
    let mut server = quinn::ServerConfig::with_crypto(Arc::new(quic));
    server.transport_config(Arc::new(config.transport_config()?));
    Ok(server)
}
