//! Asset redirect middleware.
//!
//! Large static assets are cheaper to serve straight from the storage
//! endpoint. Requests whose final path segment carries one of the configured
//! extensions are answered with a 302 pointing at the backend object URL
//! instead of being proxied and buffered.

use async_trait::async_trait;
use hyper::header::{HeaderValue, LOCATION};
use hyper::StatusCode;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::capture::CapturedResponse;
use crate::handler::{Handler, ProxyRequest};
use crate::proxy::ProxyTarget;
use crate::rewrite::extension;
use crate::{ProxyError, Result};

pub struct AssetRedirect {
    target: Arc<ProxyTarget>,
    extensions: HashSet<String>,
    next: Arc<dyn Handler>,
}

impl AssetRedirect {
    pub fn new(
        target: Arc<ProxyTarget>,
        extensions: impl IntoIterator<Item = String>,
        next: Arc<dyn Handler>,
    ) -> Self {
        Self {
            target,
            extensions: extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            next,
        }
    }
}

#[async_trait]
impl Handler for AssetRedirect {
    async fn handle(&self, req: ProxyRequest) -> Result<CapturedResponse> {
        let redirect = extension(&req.path)
            .map(|ext| self.extensions.contains(&ext))
            .unwrap_or(false);
        if !redirect {
            return self.next.handle(req).await;
        }

        let object_path = self.target.backend_path(&req.path);
        let uri = self.target.object_uri(&object_path, req.query.as_deref())?;
        debug!(path = %req.path, location = %uri, "Redirecting asset to backend");

        let mut response = CapturedResponse::with_status(StatusCode::FOUND);
        let location = HeaderValue::from_str(&uri.to_string())
            .map_err(|e| ProxyError::Http(format!("invalid redirect location: {}", e)))?;
        response.append_header(LOCATION, location);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use hyper::{HeaderMap, Method};
    use std::sync::Mutex;

    struct CountingNext {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl Handler for CountingNext {
        async fn handle(&self, _req: ProxyRequest) -> Result<CapturedResponse> {
            *self.calls.lock().unwrap() += 1;
            Ok(CapturedResponse::new())
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

    fn request(path: &str, query: Option<&str>) -> ProxyRequest {
        ProxyRequest {
            method: Method::GET,
            path: path.to_string(),
            query: query.map(String::from),
            host: "app.example.com".to_string(),
            headers: HeaderMap::new(),
        }
    }

    #[tokio::test]
    async fn test_matching_extension_redirects_to_backend() {
        let next = Arc::new(CountingNext {
            calls: Mutex::new(0),
        });
        let redirect = AssetRedirect::new(
            target(),
            vec!["mp4".to_string(), "zip".to_string()],
            next.clone(),
        );

        let response = redirect
            .handle(request("/media/clip.MP4", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.unique_header_value(&LOCATION).unwrap(),
            "https://acct.blob.example.net/web/media/clip.MP4"
        );
        assert_eq!(*next.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_query_string_carried_through() {
        let next = Arc::new(CountingNext {
            calls: Mutex::new(0),
        });
        let redirect =
            AssetRedirect::new(target(), vec!["zip".to_string()], next);

        let response = redirect
            .handle(request("/dist/app.zip", Some("v=3")))
            .await
            .unwrap();
        let location = response
            .unique_header_value(&LOCATION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(location.ends_with("/web/dist/app.zip?v=3"), "{}", location);
    }

    #[tokio::test]
    async fn test_other_extensions_pass_through() {
        let next = Arc::new(CountingNext {
            calls: Mutex::new(0),
        });
        let redirect =
            AssetRedirect::new(target(), vec!["mp4".to_string()], next.clone());

        let response = redirect
            .handle(request("/page.html", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*next.calls.lock().unwrap(), 1);
    }
}
