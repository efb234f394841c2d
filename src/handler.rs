//! Request chain capability interface.
//!
//! The middleware chain is an ordered list of [`Handler`] stages composed via
//! explicit wrapping. Each stage owns an `Arc` to the next one, which keeps
//! every middleware a small unit testable in isolation against a fake next
//! stage.

use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::{HeaderMap, Method, Request};
use std::sync::Arc;

use crate::capture::CapturedResponse;
use crate::Result;

/// The mutable view of an inbound request that flows through the chain.
///
/// Middlewares rewrite `path` on their retry attempt; the original request
/// stays untouched because every stage receives its own clone.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub host: String,
    pub headers: HeaderMap,
}

impl ProxyRequest {
    /// Extract the chain view from an inbound hyper request. The host comes
    /// from the URI authority when present, falling back to the Host header.
    pub fn from_request(req: &Request<Incoming>) -> Self {
        let host = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .or_else(|| {
                req.headers()
                    .get(HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();

        Self {
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            query: req.uri().query().map(str::to_string),
            host,
            headers: req.headers().clone(),
        }
    }

    /// The host with any `:port` suffix removed.
    pub fn host_without_port(&self) -> &str {
        match self.host.rfind(':') {
            Some(idx) if self.host[idx + 1..].chars().all(|c| c.is_ascii_digit()) => {
                &self.host[..idx]
            }
            _ => &self.host,
        }
    }
}

/// One stage of the request chain.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: ProxyRequest) -> Result<CapturedResponse>;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle(&self, req: ProxyRequest) -> Result<CapturedResponse> {
        (**self).handle(req).await
    }
}
