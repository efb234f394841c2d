//! Storage backend client.
//!
//! A thin wrapper over Hyper's pooled client that fetches objects into
//! [`CapturedResponse`] buffers and answers `HEAD` checksum probes for the
//! response cache. Requests carry a hard timeout so a wedged backend cannot
//! pin proxy workers forever.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::capture::CapturedResponse;
use crate::checksum_cache::ChecksumProbe;
use crate::config::BackendConfig;
use crate::https_connector::BlobHttpsConnector;
use crate::proxy::ProxyTarget;
use crate::{ProxyError, Result};

pub struct BlobClient {
    client: Client<BlobHttpsConnector, Full<Bytes>>,
    request_timeout: Duration,
}

impl BlobClient {
    pub fn new(backend: &BackendConfig, request_timeout: Duration) -> Self {
        let connector = BlobHttpsConnector::new(backend.insecure_skip_verify);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(60))
            .build(connector);
        Self {
            client,
            request_timeout,
        }
    }

    /// Sends a request and buffers the full response.
    pub async fn fetch(&self, request: Request<Full<Bytes>>) -> Result<CapturedResponse> {
        let uri = request.uri().clone();
        let response = timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| {
                ProxyError::Timeout(format!(
                    "backend request to {} exceeded {:?}",
                    uri, self.request_timeout
                ))
            })?
            .map_err(|e| ProxyError::Upstream(format!("backend request to {} failed: {}", uri, e)))?;

        let (parts, body) = response.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(|e| ProxyError::Http(format!("failed to collect body: {}", e)))?
            .to_bytes();
        debug!(uri = %uri, status = %parts.status, bytes = bytes.len(), "Backend response buffered");

        Ok(CapturedResponse::from_parts(
            parts.status,
            parts.headers.iter(),
            bytes,
        ))
    }
}

/// Validates cached checksums with `HEAD` requests against the backend.
pub struct ChecksumProber {
    client: Arc<BlobClient>,
    target: Arc<ProxyTarget>,
    checksum_header: hyper::header::HeaderName,
}

impl ChecksumProber {
    pub fn new(
        client: Arc<BlobClient>,
        target: Arc<ProxyTarget>,
        checksum_header: hyper::header::HeaderName,
    ) -> Self {
        Self {
            client,
            target,
            checksum_header,
        }
    }
}

#[async_trait]
impl ChecksumProbe for ChecksumProber {
    async fn probe(&self, backend_path: &str) -> Result<Option<String>> {
        let path = crate::path_join::UrlPath::plain(backend_path);
        let uri = self.target.object_uri(&path, None)?;
        let request = Request::builder()
            .method(Method::HEAD)
            .uri(uri)
            .header(hyper::header::HOST, self.target.host.as_str())
            .body(Full::new(Bytes::new()))
            .map_err(|e| ProxyError::Http(format!("failed to build HEAD request: {}", e)))?;

        let response = self.client.fetch(request).await?;
        if !response.status().is_success() {
            debug!(path = backend_path, status = %response.status(), "Checksum probe returned non-success");
            return Ok(None);
        }
        let checksum = response
            .unique_header_value(&self.checksum_header)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        if checksum.is_none() {
            warn!(path = backend_path, "Backend HEAD response had no usable checksum header");
        }
        Ok(checksum)
    }
}
