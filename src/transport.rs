//! Transport layer
//!
//! The engine talks to the network through the [`Transport`] trait: a bounded
//! `connect` producing a byte stream. [`TcpTransport`] is the stock
//! implementation, a `tokio` TCP dial with an optional rustls client
//! handshake selected by the URL scheme, both under one deadline.

use crate::config::ClientConfig;
use crate::error::{Result, SockwaveError};
use async_trait::async_trait;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{self, pki_types::ServerName};
use tokio_rustls::TlsConnector;

/// TLS peer verification mode for `wss://` connections.
#[derive(Debug, Clone)]
pub enum TlsVerify {
    /// Accept any certificate. Only for controlled environments.
    None,
    /// Verify against the bundled webpki roots.
    Peer,
    /// Bring your own rustls verifier.
    Custom(Arc<dyn rustls::client::danger::ServerCertVerifier>),
}

/// Capability contract the engine consumes: open a byte stream to a peer
/// within a deadline. Reads, writes, EOF and errors then flow through the
/// stream itself.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self, host: &str, port: u16) -> Result<Self::Stream>;
}

/// TCP transport with optional TLS, configured from [`ClientConfig`].
pub struct TcpTransport {
    nodelay: bool,
    connect_timeout: Duration,
    tls: Option<TlsConnector>,
}

impl TcpTransport {
    /// Build a transport for the given target scheme. TLS material is
    /// prepared once here, not per connection attempt.
    pub fn from_config(config: &ClientConfig, secure: bool) -> Result<Self> {
        let tls = if secure {
            Some(build_connector(&config.tls_verify)?)
        } else {
            None
        };
        Ok(Self {
            nodelay: config.nodelay,
            connect_timeout: config.connect_timeout,
            tls,
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Stream = MaybeTlsStream;

    async fn connect(&self, host: &str, port: u16) -> Result<MaybeTlsStream> {
        let deadline = Instant::now() + self.connect_timeout;
        let addr = format!("{host}:{port}");

        let tcp = timeout_at(deadline, TcpStream::connect(&addr))
            .await
            .map_err(|_| SockwaveError::TransportConnect(format!("connect to {addr} timed out")))?
            .map_err(|e| SockwaveError::TransportConnect(format!("{addr}: {e}")))?;

        if self.nodelay {
            // Best effort; some platforms reject it on connecting sockets.
            let _ = tcp.set_nodelay(true);
        }

        match &self.tls {
            None => Ok(MaybeTlsStream::Plain(tcp)),
            Some(connector) => {
                let name = ServerName::try_from(host.to_string())
                    .map_err(|e| SockwaveError::Tls(format!("invalid server name: {e}")))?;
                let stream = timeout_at(deadline, connector.connect(name, tcp))
                    .await
                    .map_err(|_| {
                        SockwaveError::TransportConnect(format!(
                            "TLS handshake with {addr} timed out"
                        ))
                    })?
                    .map_err(|e| SockwaveError::Tls(e.to_string()))?;
                Ok(MaybeTlsStream::Tls(Box::new(stream)))
            }
        }
    }
}

fn build_connector(verify: &TlsVerify) -> Result<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(|e| SockwaveError::Tls(e.to_string()))?;

    let config = match verify {
        TlsVerify::Peer => {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        TlsVerify::None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipVerification))
            .with_no_client_auth(),
        TlsVerify::Custom(verifier) => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::clone(verifier))
            .with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Certificate verifier that accepts everything, backing [`TlsVerify::None`].
#[derive(Debug)]
struct SkipVerification;

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// A plain TCP stream or a TLS session over one.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl std::fmt::Debug for MaybeTlsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain(_) => f.write_str("MaybeTlsStream::Plain"),
            Self::Tls(_) => f.write_str("MaybeTlsStream::Tls"),
        }
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
