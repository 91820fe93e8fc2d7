//! Transport seams consumed by the federation core.
//!
//! The core never performs I/O itself. It drives a [`Socket`] — a small
//! capability set over whatever byte transport the host provides — and asks
//! a [`Connector`] for new outbound sockets. The production implementations
//! live in [`crate::net`]; tests substitute in-memory stubs.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};

use crate::cert::PeerCertificate;
use crate::error::FederationError;
use crate::session::SessionId;

/// Byte-transport capability set required by the core.
///
/// `set_secure` and `renegotiate` are asynchronous in any real transport;
/// they return once the request is accepted and the adapter reports
/// completion through the owning context (`tls_established`,
/// `renegotiated`). All calls into the core for one context arrive on its
/// serial queue.
pub trait Socket: Send {
    /// Queue bytes for delivery to the peer, in call order.
    fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), FederationError>;

    /// Close the transport. Idempotent.
    fn close(&mut self);

    /// Begin a TLS upgrade over the existing connection.
    ///
    /// `servername` carries the SNI target for client-side upgrades and is
    /// `None` for server-side STARTTLS.
    fn set_secure(
        &mut self,
        credentials: &Arc<Credentials>,
        is_server: bool,
        servername: Option<&str>,
    ) -> Result<(), FederationError>;

    /// Begin a TLS renegotiation, optionally requesting a peer certificate.
    fn renegotiate(&mut self, request_cert: bool) -> Result<(), FederationError>;

    /// Whether TLS is currently active.
    fn is_secure(&self) -> bool;

    /// Whether the peer's certificate chain validated against our roots.
    fn authorized(&self) -> bool;

    /// Human-readable reason when [`Socket::authorized`] is false.
    fn authorization_error(&self) -> Option<String>;

    /// The host name this TLS session was established for (SNI).
    fn servername(&self) -> Option<String>;

    /// Identity material from the peer certificate, when one was presented.
    fn peer_certificate(&self) -> Option<PeerCertificate>;
}

/// Factory for outbound sockets.
///
/// `connect` returns immediately with a socket in connecting state; the
/// adapter reports establishment through the owning context
/// (`session_connected`) or failure through `session_closed`. The session
/// ID lets the adapter tag those callbacks.
pub trait Connector: Send {
    /// Open a transport towards the given remote domain.
    fn connect(
        &mut self,
        domain: &str,
        session: SessionId,
    ) -> Result<Box<dyn Socket>, FederationError>;
}

/// TLS material shared by every session of a context: the local certificate
/// chain, its private key, and the roots accepted for peer certificates.
///
/// Read-only after construction; sessions share one `Arc`.
pub struct Credentials {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    roots: RootCertStore,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("cert_chain", &self.cert_chain.len())
            .field("key", &"[REDACTED]")
            .field("roots", &self.roots.len())
            .finish()
    }
}

impl Credentials {
    /// Build credentials from PEM-encoded certificate chain and PKCS#8 key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, FederationError> {
        let cert_chain: Vec<_> = certs(&mut BufReader::new(cert_pem))
            .filter_map(|r| r.ok())
            .collect();
        if cert_chain.is_empty() {
            return Err(FederationError::config("no certificate found"));
        }

        let key = pkcs8_private_keys(&mut BufReader::new(key_pem))
            .filter_map(|r| r.ok())
            .next()
            .ok_or_else(|| FederationError::config("no private key found"))?;

        Ok(Self {
            cert_chain,
            key: PrivateKeyDer::Pkcs8(key),
            roots: RootCertStore::empty(),
        })
    }

    /// Build credentials from PEM files on disk.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, FederationError> {
        let cert_file = std::fs::read(cert_path.as_ref()).map_err(|e| {
            FederationError::config(format!(
                "failed to read cert file {}: {}",
                cert_path.as_ref().display(),
                e
            ))
        })?;
        let key_file = std::fs::read(key_path.as_ref()).map_err(|e| {
            FederationError::config(format!(
                "failed to read key file {}: {}",
                key_path.as_ref().display(),
                e
            ))
        })?;
        Self::from_pem(&cert_file, &key_file)
    }

    /// Add PEM-encoded CA roots accepted for peer certificates.
    pub fn with_roots_pem(mut self, roots_pem: &[u8]) -> Result<Self, FederationError> {
        for cert in certs(&mut BufReader::new(roots_pem)) {
            let cert = cert
                .map_err(|e| FederationError::config(format!("bad root certificate: {}", e)))?;
            self.roots
                .add(cert)
                .map_err(|e| FederationError::config(format!("bad root certificate: {}", e)))?;
        }
        Ok(self)
    }

    /// Add PEM-encoded CA roots from a file.
    pub fn with_roots_file(self, path: impl AsRef<Path>) -> Result<Self, FederationError> {
        let file = File::open(path.as_ref()).map_err(|e| {
            FederationError::config(format!(
                "failed to open roots file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let mut reader = BufReader::new(file);
        let mut roots = self;
        for cert in certs(&mut reader) {
            let cert = cert
                .map_err(|e| FederationError::config(format!("bad root certificate: {}", e)))?;
            roots
                .roots
                .add(cert)
                .map_err(|e| FederationError::config(format!("bad root certificate: {}", e)))?;
        }
        Ok(roots)
    }

    /// Server-side TLS configuration for inbound STARTTLS.
    ///
    /// When roots are configured, peer certificates are requested during
    /// the handshake but their absence does not fail it; the session
    /// decides later whether the stream may authenticate with EXTERNAL.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, FederationError> {
        let builder = if self.roots.is_empty() {
            ServerConfig::builder().with_no_client_auth()
        } else {
            let verifier = WebPkiClientVerifier::builder(Arc::new(self.roots.clone()))
                .allow_unauthenticated()
                .build()
                .map_err(|e| FederationError::tls(format!("client verifier: {}", e)))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        };

        let config = builder
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(|e| FederationError::tls(format!("server config: {}", e)))?;
        Ok(Arc::new(config))
    }

    /// Client-side TLS configuration for outbound STARTTLS.
    ///
    /// Presents our certificate so the remote side can offer EXTERNAL.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, FederationError> {
        if self.roots.is_empty() {
            return Err(FederationError::config(
                "no CA roots configured for outbound TLS",
            ));
        }

        let config = ClientConfig::builder()
            .with_root_certificates(self.roots.clone())
            .with_client_auth_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(|e| FederationError::tls(format!("client config: {}", e)))?;
        Ok(Arc::new(config))
    }
}
