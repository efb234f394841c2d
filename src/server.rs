//! HTTP server and middleware chain assembly.
//!
//! Owns the listener, composes the middleware chain in its fixed order, and
//! maps chain errors onto client-facing status codes. The chain order is
//! load-bearing: host routing rejects cheaply first, asset redirects
//! short-circuit before any proxying, the backlog gate sits in front of the
//! fallback stages so shed requests never trigger backend probes, and the
//! cache wraps only the terminal proxy stage.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE, ORIGIN};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::blob_client::{BlobClient, ChecksumProber};
use crate::capture::CapturedResponse;
use crate::checksum_cache::{CacheLayer, ChecksumCache};
use crate::compression::Compressor;
use crate::config::Config;
use crate::cors::CorsPolicy;
use crate::handler::{Handler, ProxyRequest};
use crate::proxy::{ProxyTarget, ReverseProxy};
use crate::redirect::AssetRedirect;
use crate::rewrite::{
    HtmlExtensionFallback, IndexFallback, SubdomainRewrite, TrailingSlashFallback,
};
use crate::shutdown::ShutdownCoordinator;
use crate::throttle::BacklogThrottle;
use crate::{ProxyError, Result};

struct ServerState {
    chain: Arc<dyn Handler>,
    cors: Option<CorsPolicy>,
    compressor: Option<Compressor>,
}

pub struct ProxyServer {
    listen_addr: SocketAddr,
    state: Arc<ServerState>,
    active_connections: Arc<AtomicUsize>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl ProxyServer {
    pub fn new(config: &Config, shutdown: Arc<ShutdownCoordinator>) -> Result<Self> {
        let listen_addr: SocketAddr =
            format!("{}:{}", config.server.bind_address, config.server.port)
                .parse()
                .map_err(|e| {
                    ProxyError::Config(format!(
                        "invalid listen address {}:{}: {}",
                        config.server.bind_address, config.server.port, e
                    ))
                })?;

        let target = Arc::new(ProxyTarget::from_config(&config.backend));
        let client = Arc::new(BlobClient::new(
            &config.backend,
            config.server.backend_request_timeout,
        ));
        let checksum_header = config.checksum_header()?;

        let mut chain: Arc<dyn Handler> =
            Arc::new(ReverseProxy::new(Arc::clone(&target), Arc::clone(&client)));

        if config.cache.enabled {
            let cache = Arc::new(ChecksumCache::new(
                config.cache.freshness_window,
                checksum_header.clone(),
            ));
            let probe = Arc::new(ChecksumProber::new(
                Arc::clone(&client),
                Arc::clone(&target),
                checksum_header,
            ));
            chain = Arc::new(CacheLayer::new(cache, probe, Arc::clone(&target), chain));
        }

        // Fallback stages, innermost first. Html sits inside TrailingSlash so
        // an extension-less miss probes `<path>.html` before `<path>/index.html`,
        // and the directory-index stage wraps both.
        chain = Arc::new(HtmlExtensionFallback::new(chain));
        chain = Arc::new(TrailingSlashFallback::new(chain));
        chain = Arc::new(IndexFallback::new(chain));

        chain = Arc::new(BacklogThrottle::new(
            config.server.max_concurrent_requests,
            config.server.backlog_queue_depth,
            config.server.backlog_wait_timeout,
            chain,
        ));

        if config.redirect.enabled {
            chain = Arc::new(AssetRedirect::new(
                Arc::clone(&target),
                config.redirect.asset_extensions.clone(),
                chain,
            ));
        }
        if config.routing.subdomain_rewrite_enabled {
            chain = Arc::new(SubdomainRewrite::new(
                config.routing.base_domain.clone(),
                config.routing.default_environment.clone(),
                chain,
            ));
        }

        let state = Arc::new(ServerState {
            chain,
            cors: config.cors.enabled.then(|| CorsPolicy::from_config(&config.cors)),
            compressor: config
                .compression
                .enabled
                .then(|| Compressor::from_config(&config.compression)),
        });

        Ok(Self {
            listen_addr,
            state,
            active_connections: Arc::new(AtomicUsize::new(0)),
            shutdown,
        })
    }

    /// Accept loop. Returns when the shutdown signal fires and in-flight
    /// connections have drained (or the grace period runs out).
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await.map_err(|e| {
            ProxyError::Io(format!("failed to bind {}: {}", self.listen_addr, e))
        })?;
        info!("Listening on {}", self.listen_addr);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("Connection from {}", addr);
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                            }
                            let state = Arc::clone(&self.state);
                            let active_connections = Arc::clone(&self.active_connections);
                            tokio::spawn(async move {
                                Self::serve_connection(stream, addr, state, active_connections)
                                    .await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping accept loop");
                    break;
                }
            }
        }

        self.drain().await;
        info!("Server stopped");
        Ok(())
    }

    async fn drain(&self) {
        let grace = self.shutdown.grace_period();
        let start = Instant::now();
        let active = self.active_connections.load(Ordering::Relaxed);
        if active == 0 {
            return;
        }
        info!("Draining {} active connections (grace: {:?})", active, grace);
        while self.active_connections.load(Ordering::Relaxed) > 0 && start.elapsed() < grace {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.active_connections.load(Ordering::Relaxed);
        if remaining > 0 {
            warn!("Shutdown with {} connections still active", remaining);
        } else {
            info!("All connections drained");
        }
    }

    async fn serve_connection(
        stream: tokio::net::TcpStream,
        addr: SocketAddr,
        state: Arc<ServerState>,
        active_connections: Arc<AtomicUsize>,
    ) {
        let io = TokioIo::new(stream);
        active_connections.fetch_add(1, Ordering::Relaxed);

        let service = service_fn(move |req| {
            let state = Arc::clone(&state);
            async move { Self::handle_request(req, state).await }
        });

        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            if err.is_canceled() || err.is_incomplete_message() {
                debug!("Client disconnected from {}: {}", addr, err);
            } else {
                error!("Error serving connection from {}: {}", addr, err);
            }
        }

        active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
        state: Arc<ServerState>,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        let request_id = Uuid::new_v4();
        let start = Instant::now();
        let proxy_req = ProxyRequest::from_request(&req);
        let method = proxy_req.method.clone();
        let path = proxy_req.path.clone();
        let origin = proxy_req.headers.get(ORIGIN).cloned();
        let request_headers = proxy_req.headers.clone();

        let mut captured = match state
            .cors
            .as_ref()
            .and_then(|cors| cors.preflight_response(&proxy_req))
        {
            Some(preflight) => preflight,
            None => match state.chain.handle(proxy_req).await {
                Ok(captured) => captured,
                Err(e) => {
                    warn!(%request_id, method = %method, path = %path, error = %e, "Request failed");
                    error_response(&e)
                }
            },
        };

        if let Some(cors) = &state.cors {
            cors.apply(origin.as_ref(), &mut captured);
        }
        if let Some(compressor) = &state.compressor {
            compressor.apply(&request_headers, &mut captured);
        }

        info!(
            %request_id,
            method = %method,
            path = %path,
            status = %captured.status(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Request served"
        );

        match captured.flush() {
            Ok(response) => Ok(response),
            Err(e) => {
                error!(%request_id, error = %e, "Failed to serialize response");
                let mut response = Response::new(Full::new(Bytes::from_static(
                    b"internal server error",
                )));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                Ok(response)
            }
        }
    }
}

/// Client-facing response for a chain error.
fn error_response(error: &ProxyError) -> CapturedResponse {
    let status = match error {
        ProxyError::Backlog(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut response = CapturedResponse::with_status(status);
    response.append_header(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response.write(status.canonical_reason().unwrap_or("error").as_bytes());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let mut config = Config::default();
        config.backend.storage_account = "acct".to_string();
        config.backend.container = "web".to_string();
        config.routing.base_domain = "example.com".to_string();
        config
    }

    #[test]
    fn test_server_builds_from_valid_config() {
        let shutdown = ShutdownCoordinator::new(Duration::from_secs(1));
        let server = ProxyServer::new(&config(), shutdown).unwrap();
        assert_eq!(server.listen_addr.port(), 8080);
    }

    #[test]
    fn test_invalid_bind_address_rejected() {
        let mut config = config();
        config.server.bind_address = "not an address".to_string();
        let shutdown = ShutdownCoordinator::new(Duration::from_secs(1));
        assert!(matches!(
            ProxyServer::new(&config, shutdown),
            Err(ProxyError::Config(_))
        ));
    }

    #[test]
    fn test_error_responses_map_to_statuses() {
        let backlog = error_response(&ProxyError::Backlog("full".to_string()));
        assert_eq!(backlog.status(), StatusCode::SERVICE_UNAVAILABLE);

        let routing = error_response(&ProxyError::RoutingRejected("bad host".to_string()));
        assert_eq!(routing.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let upstream = error_response(&ProxyError::Upstream("boom".to_string()));
        assert_eq!(upstream.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
