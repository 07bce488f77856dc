//! TLS transport security.
//!
//! Nodes with TLS enabled speak mutual TLS anchored on the mesh CA: the
//! node's key and signed certificate come from `ca_request_certificate`,
//! the CA root is the single trust anchor, and the latest CRL gates both
//! directions. Inbound, rustls's CRL-aware client-certificate verifier
//! rejects revoked peers during the handshake; outbound, the peer's serial
//! is checked against the CRL cache before the first envelope is read.
//! Either way a revoked or unverifiable peer is disconnected before any
//! application data is processed.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{bail, Context as _, Result};
use rustls::pki_types::{
    CertificateDer, CertificateRevocationListDer, PrivateKeyDer, ServerName,
};
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::warn;
use x509_parser::prelude::FromDer;

/// Lazily-initialized crypto provider for rustls.
/// Uses ring as the underlying cryptographic implementation.
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// Filesystem locations of a node's TLS material, as written by
/// `request_ssl_certificate`.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub key_path: PathBuf,
    pub certificate_path: PathBuf,
    pub ca_certificate_path: PathBuf,
    pub crl_path: PathBuf,
}

impl TlsSettings {
    /// The conventional layout under one directory:
    /// `node.key`, `node.crt`, `ca.crt`, `crl.pem`.
    pub fn from_location(ssl_location: impl AsRef<Path>) -> Self {
        let dir = ssl_location.as_ref();
        Self {
            key_path: dir.join("node.key"),
            certificate_path: dir.join("node.crt"),
            ca_certificate_path: dir.join("ca.crt"),
            crl_path: dir.join("crl.pem"),
        }
    }
}

/// Ready-to-use TLS state for a node: one acceptor, one connector, and the
/// set of revoked serials for the outbound check.
#[derive(Clone)]
pub struct TlsContext {
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
    revoked_serials: Arc<HashSet<Vec<u8>>>,
}

impl TlsContext {
    pub fn from_settings(settings: &TlsSettings) -> Result<Self> {
        let certs = load_certificates(&settings.certificate_path)?;
        let key = load_private_key(&settings.key_path)?;
        let ca_certs = load_certificates(&settings.ca_certificate_path)?;
        let crls = load_crls(&settings.crl_path)?;
        let revoked_serials = revoked_serials(&crls)?;

        let mut roots = RootCertStore::empty();
        for cert in &ca_certs {
            roots
                .add(cert.clone())
                .context("CA root certificate rejected by trust store")?;
        }
        let roots = Arc::new(roots);

        let client_verifier = rustls::server::WebPkiClientVerifier::builder_with_provider(
            roots.clone(),
            CRYPTO_PROVIDER.clone(),
        )
        .with_crls(crls)
        .build()
        .context("failed to build CRL-aware client verifier")?;

        let server_config = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
            .with_safe_default_protocol_versions()
            .context("failed to select TLS protocol versions")?
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(certs.clone(), key.clone_key())
            .context("failed to build server TLS config")?;

        let client_config = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
            .with_safe_default_protocol_versions()
            .context("failed to select TLS protocol versions")?
            .with_root_certificates(roots.as_ref().clone())
            .with_client_auth_cert(certs, key)
            .context("failed to build client TLS config")?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
            revoked_serials: Arc::new(revoked_serials),
        })
    }

    pub async fn accept(&self, stream: TcpStream) -> Result<PeerStream> {
        let tls = self
            .acceptor
            .accept(stream)
            .await
            .context("TLS accept failed")?;
        Ok(PeerStream::Tls(Box::new(TlsStream::Server(tls))))
    }

    /// Client-side handshake plus the post-handshake CRL serial check the
    /// standard server-certificate path does not perform.
    pub async fn connect(&self, stream: TcpStream, host: &str) -> Result<PeerStream> {
        let server_name = ServerName::try_from(host.to_string())
            .with_context(|| format!("invalid TLS server name: {host}"))?;
        let tls = self
            .connector
            .connect(server_name, stream)
            .await
            .context("TLS connect failed")?;

        if let Some(serial) = peer_serial(tls.get_ref().1.peer_certificates()) {
            if self.revoked_serials.contains(&serial) {
                warn!(
                    serial = %hex::encode(&serial),
                    "refusing connection: peer certificate is revoked"
                );
                bail!("peer certificate is revoked");
            }
        }

        Ok(PeerStream::Tls(Box::new(TlsStream::Client(tls))))
    }
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("cannot read certificate file {}", path.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("malformed certificate PEM in {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("cannot read key file {}", path.display()))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .with_context(|| format!("malformed key PEM in {}", path.display()))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", path.display()))
}

fn load_crls(path: &Path) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    // A missing CRL file means nothing has been revoked yet.
    let pem = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("cannot read CRL file {}", path.display()))
        }
    };
    rustls_pemfile::crls(&mut pem.as_slice())
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("malformed CRL PEM in {}", path.display()))
}

fn revoked_serials(crls: &[CertificateRevocationListDer<'static>]) -> Result<HashSet<Vec<u8>>> {
    let mut serials = HashSet::new();
    for crl in crls {
        let (_, parsed) = x509_parser::revocation_list::CertificateRevocationList::from_der(
            crl.as_ref(),
        )
        .map_err(|e| anyhow::anyhow!("unparseable CRL: {e}"))?;
        for revoked in parsed.iter_revoked_certificates() {
            serials.insert(revoked.raw_serial().to_vec());
        }
    }
    Ok(serials)
}

fn peer_serial(certs: Option<&[CertificateDer<'_>]>) -> Option<Vec<u8>> {
    let cert = certs?.first()?;
    let (_, parsed) = x509_parser::certificate::X509Certificate::from_der(cert.as_ref()).ok()?;
    Some(parsed.raw_serial().to_vec())
}

/// One peer connection, plain or TLS, behind a uniform stream type.
pub enum PeerStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl PeerStream {
    pub fn remote_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            PeerStream::Plain(s) => s.peer_addr(),
            PeerStream::Tls(s) => s.get_ref().0.peer_addr(),
        }
    }
}

impl AsyncRead for PeerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            PeerStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PeerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            PeerStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_flush(cx),
            PeerStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            PeerStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
