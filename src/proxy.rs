//! Reverse proxy core.
//!
//! The terminal stage of the chain. Rewrites the already-rewritten request's
//! scheme, host, path, and query to point at the backend container and
//! forwards it, returning the backend response verbatim.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, HOST, USER_AGENT};
use hyper::{Request, Uri};
use std::sync::Arc;
use tracing::debug;

use crate::blob_client::BlobClient;
use crate::capture::CapturedResponse;
use crate::config::BackendConfig;
use crate::handler::{Handler, ProxyRequest};
use crate::path_join::{join, merge_queries, UrlPath};
use crate::{ProxyError, Result};

/// The immutable backend target, derived once from configuration and shared
/// read-only by every stage that needs to name the backend.
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    pub scheme: String,
    pub host: String,
    pub base_path: UrlPath,
    pub query: Option<String>,
}

impl ProxyTarget {
    pub fn from_config(backend: &BackendConfig) -> Self {
        Self {
            scheme: "https".to_string(),
            host: format!("{}.{}", backend.storage_account, backend.endpoint_domain),
            base_path: UrlPath::plain(format!("/{}", backend.container)),
            query: None,
        }
    }

    /// The resolved backend path for a client-facing request path. This is
    /// the cache key component: two different client paths that join to the
    /// same backend object must collide here.
    pub fn backend_path(&self, request_path: &str) -> UrlPath {
        join(&self.base_path, &UrlPath::plain(request_path))
    }

    /// Fully qualified backend URI for an already-joined path.
    pub fn object_uri(&self, path: &UrlPath, request_query: Option<&str>) -> Result<Uri> {
        let path_and_query = match merge_queries(self.query.as_deref(), request_query) {
            Some(query) => format!("{}?{}", path.escaped_or_plain(), query),
            None => path.escaped_or_plain().to_string(),
        };
        Uri::builder()
            .scheme(self.scheme.as_str())
            .authority(self.host.as_str())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ProxyError::Http(format!("invalid backend URI: {}", e)))
    }
}

/// Build the outbound backend request for an inbound chain request.
///
/// The Host header is forced to the backend host, and User-Agent is blanked
/// unless the client supplied one so the HTTP client's default never leaks
/// upstream.
pub fn build_outbound_request(
    target: &ProxyTarget,
    req: &ProxyRequest,
) -> Result<Request<Full<Bytes>>> {
    let backend_path = target.backend_path(&req.path);
    let uri = target.object_uri(&backend_path, req.query.as_deref())?;

    let mut outbound = Request::builder()
        .method(req.method.clone())
        .uri(uri)
        .body(Full::default())?;

    let headers = outbound.headers_mut();
    for (name, value) in req.headers.iter() {
        headers.insert(name.clone(), value.clone());
    }
    headers.insert(
        HOST,
        HeaderValue::from_str(&target.host)
            .map_err(|e| ProxyError::Http(format!("invalid backend host header: {}", e)))?,
    );
    if !req.headers.contains_key(USER_AGENT) {
        headers.insert(USER_AGENT, HeaderValue::from_static(""));
    }

    Ok(outbound)
}

/// Terminal handler forwarding requests to the backend container.
pub struct ReverseProxy {
    target: Arc<ProxyTarget>,
    client: Arc<BlobClient>,
}

impl ReverseProxy {
    pub fn new(target: Arc<ProxyTarget>, client: Arc<BlobClient>) -> Self {
        Self { target, client }
    }
}

#[async_trait]
impl Handler for ReverseProxy {
    async fn handle(&self, req: ProxyRequest) -> Result<CapturedResponse> {
        let outbound = build_outbound_request(&self.target, &req)?;
        debug!(uri = %outbound.uri(), method = %req.method, "Proxying request to backend");
        self.client.fetch(outbound).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::{HeaderMap, Method};

    fn target() -> ProxyTarget {
        ProxyTarget::from_config(&BackendConfig {
            storage_account: "frontend".to_string(),
            container: "web".to_string(),
            endpoint_domain: "blob.core.windows.net".to_string(),
            checksum_header: "content-md5".to_string(),
            insecure_skip_verify: false,
        })
    }

    fn request(path: &str, query: Option<&str>) -> ProxyRequest {
        ProxyRequest {
            method: Method::GET,
            path: path.to_string(),
            query: query.map(str::to_string),
            host: "app.example.com".to_string(),
            headers: HeaderMap::new(),
        }
    }

    #[test]
    fn test_backend_path_joins_container_base() {
        let target = target();
        assert_eq!(target.backend_path("/app/x.js").plain, "/web/app/x.js");
        assert_eq!(target.backend_path("x.js").plain, "/web/x.js");
    }

    #[test]
    fn test_object_uri_merges_queries() {
        let mut target = target();
        target.query = Some("restype=container".to_string());
        let path = target.backend_path("/a");
        let uri = target.object_uri(&path, Some("v=2")).unwrap();
        assert_eq!(
            uri.to_string(),
            "https://frontend.blob.core.windows.net/web/a?restype=container&v=2"
        );
    }

    #[test]
    fn test_outbound_request_forces_host_and_blank_user_agent() {
        let target = target();
        let outbound = build_outbound_request(&target, &request("/index.html", None)).unwrap();

        assert_eq!(
            outbound.uri().to_string(),
            "https://frontend.blob.core.windows.net/web/index.html"
        );
        assert_eq!(
            outbound.headers().get(HOST).unwrap(),
            "frontend.blob.core.windows.net"
        );
        assert_eq!(outbound.headers().get(USER_AGENT).unwrap(), "");
    }

    #[test]
    fn test_outbound_request_keeps_client_user_agent() {
        let target = target();
        let mut req = request("/", None);
        req.headers
            .insert(USER_AGENT, HeaderValue::from_static("curl/8.0"));

        let outbound = build_outbound_request(&target, &req).unwrap();
        assert_eq!(outbound.headers().get(USER_AGENT).unwrap(), "curl/8.0");
    }
}
