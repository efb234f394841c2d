//! Checksum-validated response cache.
//!
//! Maps `(method, resolved backend path)` to a captured response plus the
//! content checksum the backend reported for it. Entries inside the
//! freshness window are served without backend contact; stale entries are
//! re-validated with a single HEAD probe and either refreshed or invalidated.
//! Keys are backend paths, not client-facing URLs: two different client
//! paths that resolve to the same backend object share one entry.
//!
//! The cache grows without bound; for the static-site deployments this proxy
//! fronts, the working set is the container itself.

use async_trait::async_trait;
use dashmap::DashMap;
use hyper::header::HeaderName;
use hyper::Method;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::capture::CapturedResponse;
use crate::handler::{Handler, ProxyRequest};
use crate::inflight::{FlightGuard, FlightRole, FlightTracker};
use crate::proxy::ProxyTarget;
use crate::{ProxyError, Result};

/// Capability for fetching the current checksum of a backend object.
///
/// Returns `Ok(None)` when the backend answered without exactly one checksum
/// header value, and `Err` for transport failures.
#[async_trait]
pub trait ChecksumProbe: Send + Sync {
    async fn probe(&self, backend_path: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    method: Method,
    backend_path: String,
}

struct CacheEntry {
    checksum: String,
    response: CapturedResponse,
    last_validated: Instant,
}

/// Shared response cache validated by backend-supplied checksums.
///
/// Owned by the server and handed to the cache middleware at construction;
/// checksums are opaque strings, never recomputed locally.
pub struct ChecksumCache {
    entries: DashMap<CacheKey, CacheEntry>,
    freshness_window: Duration,
    checksum_header: HeaderName,
}

impl ChecksumCache {
    pub fn new(freshness_window: Duration, checksum_header: HeaderName) -> Self {
        Self {
            entries: DashMap::new(),
            freshness_window,
            checksum_header,
        }
    }

    /// Look up a cached response, re-validating stale entries against the
    /// backend.
    ///
    /// A probe transport error counts as a miss but keeps the entry: the
    /// stale response is never served unvalidated, and a transient network
    /// blip does not destroy a still-correct entry.
    pub async fn lookup(
        &self,
        method: &Method,
        backend_path: &str,
        probe: &dyn ChecksumProbe,
    ) -> Option<CapturedResponse> {
        if *method != Method::GET {
            return None;
        }
        let key = CacheKey {
            method: method.clone(),
            backend_path: backend_path.to_string(),
        };

        // Clone out of the map so no shard lock is held across the probe.
        let (cached_checksum, cached_response) = {
            let entry = self.entries.get(&key)?;
            if entry.last_validated.elapsed() < self.freshness_window {
                debug!(path = %backend_path, "Cache hit (fresh)");
                return Some(entry.response.clone());
            }
            (entry.checksum.clone(), entry.response.clone())
        };

        match probe.probe(backend_path).await {
            Ok(Some(current)) if current == cached_checksum => {
                if let Some(mut entry) = self.entries.get_mut(&key) {
                    entry.last_validated = Instant::now();
                }
                debug!(path = %backend_path, "Cache hit (re-validated)");
                Some(cached_response)
            }
            Ok(current) => {
                debug!(
                    path = %backend_path,
                    cached = %cached_checksum,
                    current = ?current,
                    "Cache checksum mismatch, invalidating entry"
                );
                self.entries.remove(&key);
                None
            }
            Err(e) => {
                warn!(path = %backend_path, error = %e, "Checksum probe failed, treating as miss");
                None
            }
        }
    }

    /// Store a response. Only GET responses carrying exactly one checksum
    /// header value are cached; anything else is silently skipped. An
    /// existing entry for the key is overwritten unconditionally.
    pub fn store(&self, method: &Method, backend_path: &str, response: &CapturedResponse) {
        if *method != Method::GET {
            return;
        }
        let checksum = match response
            .unique_header_value(&self.checksum_header)
            .and_then(|v| v.to_str().ok())
        {
            Some(checksum) => checksum.to_string(),
            None => return,
        };

        debug!(path = %backend_path, checksum = %checksum, "Caching response");
        self.entries.insert(
            CacheKey {
                method: method.clone(),
                backend_path: backend_path.to_string(),
            },
            CacheEntry {
                checksum,
                response: response.clone(),
                last_validated: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cache middleware sitting directly in front of the reverse proxy core.
///
/// Misses for the same key are coalesced through a [`FlightTracker`] so
/// concurrent first-time GETs cost a single backend fetch.
pub struct CacheLayer {
    cache: Arc<ChecksumCache>,
    probe: Arc<dyn ChecksumProbe>,
    target: Arc<ProxyTarget>,
    flights: FlightTracker,
    next: Arc<dyn Handler>,
}

impl CacheLayer {
    pub fn new(
        cache: Arc<ChecksumCache>,
        probe: Arc<dyn ChecksumProbe>,
        target: Arc<ProxyTarget>,
        next: Arc<dyn Handler>,
    ) -> Self {
        Self {
            cache,
            probe,
            target,
            flights: FlightTracker::new(),
            next,
        }
    }

    /// Runs the backend fetch for a flight this request won.
    ///
    /// The previous fetcher for the same key may have stored its response
    /// between our cache miss and the flight registration, so the cache gets
    /// one more look before the backend does.
    async fn fill_flight(
        &self,
        guard: FlightGuard,
        req: ProxyRequest,
        method: &Method,
        backend_path: &str,
    ) -> Result<CapturedResponse> {
        if let Some(hit) = self
            .cache
            .lookup(method, backend_path, self.probe.as_ref())
            .await
        {
            guard.complete(hit.clone());
            return Ok(hit);
        }

        match self.next.handle(req).await {
            Ok(response) => {
                self.cache.store(method, backend_path, &response);
                guard.complete(response.clone());
                Ok(response)
            }
            Err(e) => {
                guard.complete_error(e.to_string());
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Handler for CacheLayer {
    async fn handle(&self, req: ProxyRequest) -> Result<CapturedResponse> {
        if req.method != Method::GET {
            return self.next.handle(req).await;
        }

        let backend_path = self.target.backend_path(&req.path).plain;
        if let Some(hit) = self
            .cache
            .lookup(&req.method, &backend_path, self.probe.as_ref())
            .await
        {
            return Ok(hit);
        }

        let method = req.method.clone();
        let flight_key = format!("{} {}", method, backend_path);
        match self.flights.try_register(&flight_key) {
            FlightRole::Fetcher(guard) => {
                self.fill_flight(guard, req, &method, &backend_path).await
            }
            FlightRole::Waiter(mut rx) => match rx.recv().await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(message)) => Err(ProxyError::Upstream(message)),
                // Fetcher abandoned (panic or cancellation): fall back to our
                // own fetch rather than hanging.
                Err(_) => {
                    let response = self.next.handle(req).await?;
                    self.cache.store(&method, &backend_path, &response);
                    Ok(response)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use hyper::header::HeaderValue;
    use hyper::{HeaderMap, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn md5_header() -> HeaderName {
        HeaderName::from_static("content-md5")
    }

    fn response_with_checksum(checksum: &str) -> CapturedResponse {
        let mut response = CapturedResponse::with_status(StatusCode::OK);
        response.append_header(md5_header(), HeaderValue::from_str(checksum).unwrap());
        response.set_body(bytes::Bytes::from_static(b"hello"));
        response
    }

    struct FixedProbe {
        checksum: Option<String>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl FixedProbe {
        fn returning(checksum: Option<&str>) -> Self {
            Self {
                checksum: checksum.map(str::to_string),
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                checksum: None,
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChecksumProbe for FixedProbe {
        async fn probe(&self, _backend_path: &str) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProxyError::Connection("probe refused".to_string()));
            }
            Ok(self.checksum.clone())
        }
    }

    #[tokio::test]
    async fn test_fresh_hit_skips_probe() {
        let cache = ChecksumCache::new(Duration::from_secs(3600), md5_header());
        let probe = FixedProbe::returning(Some("abc"));

        cache.store(&Method::GET, "/web/a.html", &response_with_checksum("abc"));
        let hit = cache.lookup(&Method::GET, "/web/a.html", &probe).await;

        assert!(hit.is_some());
        assert_eq!(probe.call_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_entry_probed_once_and_refreshed_on_match() {
        let cache = ChecksumCache::new(Duration::ZERO, md5_header());
        let probe = FixedProbe::returning(Some("abc"));

        cache.store(&Method::GET, "/web/a.html", &response_with_checksum("abc"));
        let hit = cache.lookup(&Method::GET, "/web/a.html", &probe).await;

        assert!(hit.is_some());
        assert_eq!(probe.call_count(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_checksum_invalidates() {
        let cache = ChecksumCache::new(Duration::ZERO, md5_header());
        let probe = FixedProbe::returning(Some("zzz"));

        cache.store(&Method::GET, "/web/a.html", &response_with_checksum("abc"));
        assert!(cache
            .lookup(&Method::GET, "/web/a.html", &probe)
            .await
            .is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_probe_failure_is_miss_but_entry_survives() {
        let cache = ChecksumCache::new(Duration::ZERO, md5_header());
        let probe = FixedProbe::failing();

        cache.store(&Method::GET, "/web/a.html", &response_with_checksum("abc"));
        assert!(cache
            .lookup(&Method::GET, "/web/a.html", &probe)
            .await
            .is_none());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_store_requires_get_and_single_checksum() {
        let cache = ChecksumCache::new(Duration::from_secs(60), md5_header());

        cache.store(&Method::HEAD, "/web/a", &response_with_checksum("abc"));
        assert!(cache.is_empty());

        let uncachable = CapturedResponse::with_status(StatusCode::OK);
        cache.store(&Method::GET, "/web/b", &uncachable);
        assert!(cache.is_empty());

        let mut doubled = response_with_checksum("abc");
        doubled.append_header(md5_header(), HeaderValue::from_static("def"));
        cache.store(&Method::GET, "/web/c", &doubled);
        assert!(cache.is_empty());

        cache.store(&Method::GET, "/web/d", &response_with_checksum("abc"));
        assert_eq!(cache.len(), 1);
    }

    struct CountingNext {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Handler for CountingNext {
        async fn handle(&self, _req: ProxyRequest) -> Result<CapturedResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(response_with_checksum("abc"))
        }
    }

    #[tokio::test]
    async fn test_flight_winner_reuses_entry_stored_since_its_miss() {
        let cache = Arc::new(ChecksumCache::new(Duration::from_secs(3600), md5_header()));
        let next = Arc::new(CountingNext {
            calls: AtomicUsize::new(0),
        });
        let target = Arc::new(ProxyTarget::from_config(&BackendConfig {
            storage_account: "acct".to_string(),
            container: "web".to_string(),
            endpoint_domain: "blob.example.net".to_string(),
            checksum_header: "content-md5".to_string(),
            insecure_skip_verify: false,
        }));
        let layer = CacheLayer::new(
            cache.clone(),
            Arc::new(FixedProbe::returning(Some("abc"))),
            target,
            next.clone(),
        );

        // This request missed the cache and won the flight, but the previous
        // fetcher for the same key stored its response in between.
        let guard = match layer.flights.try_register("GET /web/a.html") {
            FlightRole::Fetcher(guard) => guard,
            FlightRole::Waiter(_) => panic!("no other flight registered"),
        };
        cache.store(&Method::GET, "/web/a.html", &response_with_checksum("abc"));

        let req = ProxyRequest {
            method: Method::GET,
            path: "/a.html".to_string(),
            query: None,
            host: "app.example.com".to_string(),
            headers: HeaderMap::new(),
        };
        let response = layer
            .fill_flight(guard, req, &Method::GET, "/web/a.html")
            .await
            .unwrap();

        assert_eq!(response.body().as_ref(), b"hello");
        assert_eq!(next.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_store_overwrites_existing_entry() {
        let cache = ChecksumCache::new(Duration::from_secs(3600), md5_header());
        let probe = FixedProbe::returning(None);

        cache.store(&Method::GET, "/web/a", &response_with_checksum("old"));
        let mut updated = response_with_checksum("new");
        updated.set_body(bytes::Bytes::from_static(b"updated"));
        cache.store(&Method::GET, "/web/a", &updated);

        let hit = cache.lookup(&Method::GET, "/web/a", &probe).await.unwrap();
        assert_eq!(hit.body().as_ref(), b"updated");
    }
}
