//! Custom HTTPS connector for the Hyper client.
//!
//! Implements the tower::Service trait required by Hyper's pooled client and
//! establishes TLS connections to the storage endpoint using tokio-rustls.
//! Certificate verification defaults to the webpki root store; it can be
//! switched off for test endpoints with self-signed certificates, which is
//! logged loudly at startup.

use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tower::Service;
use tracing::{debug, warn};

use crate::{ProxyError, Result};

/// Wrapper type for TLS streams that implements the Connection trait.
pub struct HttpsStream(TlsStream<TcpStream>);

impl Read for HttpsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        let mut tokio_buf = tokio::io::ReadBuf::uninit(unsafe { buf.as_mut() });
        match Pin::new(&mut self.0).poll_read(cx, &mut tokio_buf) {
            Poll::Ready(Ok(())) => {
                let filled = tokio_buf.filled().len();
                unsafe {
                    buf.advance(filled);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Write for HttpsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl Connection for HttpsStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Builds the rustls client config for the storage endpoint.
pub fn tls_client_config(insecure_skip_verify: bool) -> rustls::ClientConfig {
    if insecure_skip_verify {
        warn!("TLS certificate verification is DISABLED for backend connections");
        let provider = rustls::crypto::ring::default_provider();
        return rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DisabledCertVerification(Arc::new(
                provider,
            ))))
            .with_no_client_auth();
    }

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

/// Accepts any server certificate. Only reachable through the explicit
/// `insecure_skip_verify` backend setting.
#[derive(Debug)]
struct DisabledCertVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for DisabledCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Connects to the storage endpoint over TLS for every outbound request the
/// pool cannot satisfy with an idle connection.
pub struct BlobHttpsConnector {
    tls_connector: TlsConnector,
}

impl BlobHttpsConnector {
    pub fn new(insecure_skip_verify: bool) -> Self {
        let config = tls_client_config(insecure_skip_verify);
        Self {
            tls_connector: TlsConnector::from(Arc::new(config)),
        }
    }
}

impl Service<Uri> for BlobHttpsConnector {
    type Response = HttpsStream;
    type Error = ProxyError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tls_connector = self.tls_connector.clone();

        Box::pin(async move {
            let hostname = uri
                .host()
                .ok_or_else(|| ProxyError::Config("no host in URI".to_string()))?
                .to_string();
            let port = uri.port_u16().unwrap_or(443);

            debug!(host = %hostname, port, "Connecting to storage endpoint");
            let tcp = TcpStream::connect((hostname.as_str(), port))
                .await
                .map_err(|e| {
                    warn!(host = %hostname, port, error = %e, "TCP connection failed");
                    ProxyError::Connection(format!(
                        "failed to connect to {}:{}: {}",
                        hostname, port, e
                    ))
                })?;
            if let Err(e) = tcp.set_nodelay(true) {
                warn!(host = %hostname, error = %e, "Failed to set TCP_NODELAY");
            }

            let server_name = ServerName::try_from(hostname.clone()).map_err(|e| {
                ProxyError::Tls(format!("invalid server name '{}': {}", hostname, e))
            })?;
            let tls = tls_connector.connect(server_name, tcp).await.map_err(|e| {
                warn!(host = %hostname, error = %e, "TLS handshake failed");
                ProxyError::Tls(format!("TLS handshake failed to {}: {}", hostname, e))
            })?;

            Ok(HttpsStream(tls))
        })
    }
}

impl Clone for BlobHttpsConnector {
    fn clone(&self) -> Self {
        Self {
            tls_connector: self.tls_connector.clone(),
        }
    }
}
