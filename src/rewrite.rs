//! Request path rewriting middlewares.
//!
//! [`SubdomainRewrite`] maps the extra host label onto a path prefix before
//! anything touches the backend. The three not-found fallbacks each capture
//! the next stage's response and, on a 404, retry exactly once with a
//! rewritten path. A middleware always inspects the path it was given, never
//! a path mutated by an inner retry, so failed fallback attempts cannot leak
//! rewritten paths outward.

use async_trait::async_trait;
use hyper::StatusCode;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::capture::CapturedResponse;
use crate::handler::{Handler, ProxyRequest};
use crate::{ProxyError, Result};

/// True when the final path segment carries a file extension.
pub fn has_extension(path: &str) -> bool {
    path.rsplit('/')
        .next()
        .map(|segment| segment.contains('.'))
        .unwrap_or(false)
}

/// The file extension of the final path segment, lowercased.
pub fn extension(path: &str) -> Option<String> {
    let segment = path.rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_ascii_lowercase())
    }
}

/// The index document for the directory a path points into: the path itself
/// for directory-style paths, its parent directory otherwise.
fn directory_index(path: &str) -> String {
    if let Some(stripped) = path.strip_suffix('/') {
        return format!("{}/index.html", stripped);
    }
    match path.rfind('/') {
        Some(0) | None => "/index.html".to_string(),
        Some(idx) => format!("{}/index.html", &path[..idx]),
    }
}

/// Maps the subdomain label below the base domain onto a path prefix.
///
/// `app.example.com` becomes `/app/...`, the bare base domain falls back to
/// the configured default environment, and anything deeper than one extra
/// label is rejected rather than guessed at.
pub struct SubdomainRewrite {
    base_domain: String,
    default_environment: String,
    next: Arc<dyn Handler>,
}

impl SubdomainRewrite {
    pub fn new(
        base_domain: impl Into<String>,
        default_environment: impl Into<String>,
        next: Arc<dyn Handler>,
    ) -> Self {
        Self {
            base_domain: base_domain.into(),
            default_environment: default_environment.into(),
            next,
        }
    }

    fn environment_for(&self, host: &str) -> Result<String> {
        if host == self.base_domain {
            return Ok(self.default_environment.clone());
        }
        let label = host
            .strip_suffix(&format!(".{}", self.base_domain))
            .ok_or_else(|| {
                ProxyError::RoutingRejected(format!(
                    "host {} did not match base domain {}",
                    host, self.base_domain
                ))
            })?;
        if label.is_empty() || label.contains('.') {
            return Err(ProxyError::RoutingRejected(format!(
                "host {} has too many subdomain levels below {}",
                host, self.base_domain
            )));
        }
        Ok(label.to_string())
    }
}

#[async_trait]
impl Handler for SubdomainRewrite {
    async fn handle(&self, mut req: ProxyRequest) -> Result<CapturedResponse> {
        let environment = match self.environment_for(req.host_without_port()) {
            Ok(environment) => environment,
            Err(e) => {
                warn!(host = %req.host, error = %e, "Rejecting request");
                return Err(e);
            }
        };
        req.path = format!("/{}{}", environment, req.path);
        self.next.handle(req).await
    }
}

/// Retries a 404 against the directory index document.
pub struct IndexFallback {
    next: Arc<dyn Handler>,
}

impl IndexFallback {
    pub fn new(next: Arc<dyn Handler>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl Handler for IndexFallback {
    async fn handle(&self, req: ProxyRequest) -> Result<CapturedResponse> {
        let first = self.next.handle(req.clone()).await?;
        if first.status() != StatusCode::NOT_FOUND || req.path.ends_with("/index.html") {
            return Ok(first);
        }

        let mut retry = req;
        retry.path = directory_index(&retry.path);
        debug!(path = %retry.path, "Not found, retrying directory index");
        self.next.handle(retry).await
    }
}

/// Retries a 404 on an extension-less path with `.html` appended.
pub struct HtmlExtensionFallback {
    next: Arc<dyn Handler>,
}

impl HtmlExtensionFallback {
    pub fn new(next: Arc<dyn Handler>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl Handler for HtmlExtensionFallback {
    async fn handle(&self, req: ProxyRequest) -> Result<CapturedResponse> {
        let first = self.next.handle(req.clone()).await?;
        if first.status() != StatusCode::NOT_FOUND
            || has_extension(&req.path)
            || req.path.ends_with('/')
        {
            return Ok(first);
        }

        let mut retry = req;
        retry.path = format!("{}.html", retry.path);
        debug!(path = %retry.path, "Not found, retrying with .html extension");
        self.next.handle(retry).await
    }
}

/// Retries a 404 on an extension-less path as a directory with an index
/// document.
pub struct TrailingSlashFallback {
    next: Arc<dyn Handler>,
}

impl TrailingSlashFallback {
    pub fn new(next: Arc<dyn Handler>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl Handler for TrailingSlashFallback {
    async fn handle(&self, req: ProxyRequest) -> Result<CapturedResponse> {
        let first = self.next.handle(req.clone()).await?;
        if first.status() != StatusCode::NOT_FOUND
            || has_extension(&req.path)
            || req.path.ends_with('/')
        {
            return Ok(first);
        }

        let mut retry = req;
        retry.path = format!("{}/index.html", retry.path);
        debug!(path = %retry.path, "Not found, retrying as directory index");
        self.next.handle(retry).await
    }
}
