//! Integration tests for host-based routing and the asset redirect
//! short-circuit, composed in their serving order.

use async_trait::async_trait;
use blob_proxy::capture::CapturedResponse;
use blob_proxy::config::BackendConfig;
use blob_proxy::handler::{Handler, ProxyRequest};
use blob_proxy::proxy::ProxyTarget;
use blob_proxy::redirect::AssetRedirect;
use blob_proxy::rewrite::SubdomainRewrite;
use blob_proxy::{ProxyError, Result};
use bytes::Bytes;
use hyper::header::LOCATION;
use hyper::{HeaderMap, Method, StatusCode};
use std::sync::{Arc, Mutex};

/// Records the path the chain finally asked the backend for.
struct RecordingBackend {
    paths: Mutex<Vec<String>>,
}

impl RecordingBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            paths: Mutex::new(Vec::new()),
        })
    }

    fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }
}

#[async_trait]
impl Handler for RecordingBackend {
    async fn handle(&self, req: ProxyRequest) -> Result<CapturedResponse> {
        self.paths.lock().unwrap().push(req.path.clone());
        let mut response = CapturedResponse::with_status(StatusCode::OK);
        response.set_body(Bytes::from_static(b"ok"));
        Ok(response)
    }
}

fn target() -> Arc<ProxyTarget> {
    Arc::new(ProxyTarget::from_config(&BackendConfig {
        storage_account: "acct".to_string(),
        container: "web".to_string(),
        endpoint_domain: "blob.example.net".to_string(),
        checksum_header: "content-md5".to_string(),
        insecure_skip_verify: false,
    }))
}

/// Routing in serving order: subdomain rewrite outermost, asset redirect
/// directly inside it.
fn routing_chain(backend: Arc<RecordingBackend>) -> Arc<dyn Handler> {
    let chain: Arc<dyn Handler> = Arc::new(AssetRedirect::new(
        target(),
        vec!["js".to_string(), "mp4".to_string()],
        backend,
    ));
    Arc::new(SubdomainRewrite::new("example.com", "production", chain))
}

fn get(host: &str, path: &str) -> ProxyRequest {
    ProxyRequest {
        method: Method::GET,
        path: path.to_string(),
        query: None,
        host: host.to_string(),
        headers: HeaderMap::new(),
    }
}

#[tokio::test]
async fn subdomain_becomes_path_prefix() {
    let backend = RecordingBackend::new();
    let chain = routing_chain(backend.clone());

    let response = chain
        .handle(get("app.example.com", "/about.html"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(backend.paths(), vec!["/app/about.html"]);
}

#[tokio::test]
async fn bare_domain_routes_to_default_environment() {
    let backend = RecordingBackend::new();
    let chain = routing_chain(backend.clone());

    chain
        .handle(get("example.com", "/about.html"))
        .await
        .unwrap();

    assert_eq!(backend.paths(), vec!["/production/about.html"]);
}

#[tokio::test]
async fn host_port_is_ignored_for_routing() {
    let backend = RecordingBackend::new();
    let chain = routing_chain(backend.clone());

    chain
        .handle(get("app.example.com:8080", "/x"))
        .await
        .unwrap();

    assert_eq!(backend.paths(), vec!["/app/x"]);
}

#[tokio::test]
async fn nested_subdomain_is_rejected_before_the_backend() {
    let backend = RecordingBackend::new();
    let chain = routing_chain(backend.clone());

    let err = chain
        .handle(get("a.b.example.com", "/x"))
        .await
        .unwrap_err();

    assert!(matches!(err, ProxyError::RoutingRejected(_)));
    assert!(backend.paths().is_empty());
}

#[tokio::test]
async fn asset_extension_redirects_to_rewritten_backend_url() {
    let backend = RecordingBackend::new();
    let chain = routing_chain(backend.clone());

    let response = chain
        .handle(get("app.example.com", "/bundle.js"))
        .await
        .unwrap();

    // The redirect happens after host routing, so the location carries the
    // environment prefix and the backend never sees the request.
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response
            .unique_header_value(&LOCATION)
            .unwrap()
            .to_str()
            .unwrap(),
        "https://acct.blob.example.net/web/app/bundle.js"
    );
    assert!(backend.paths().is_empty());
}
