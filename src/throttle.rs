//! Backlog throttle.
//!
//! Bounds the number of requests proxied concurrently and the number allowed
//! to queue behind them. Anything beyond the queue, or anything that queues
//! longer than the configured wait, is shed with a backlog error so the
//! server can answer 503 instead of piling work onto a slow backend.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::warn;

use crate::capture::CapturedResponse;
use crate::handler::{Handler, ProxyRequest};
use crate::{ProxyError, Result};

pub struct BacklogThrottle {
    permits: Arc<Semaphore>,
    waiting: AtomicUsize,
    queue_depth: usize,
    wait_timeout: Duration,
    next: Arc<dyn Handler>,
}

impl BacklogThrottle {
    pub fn new(
        concurrency: usize,
        queue_depth: usize,
        wait_timeout: Duration,
        next: Arc<dyn Handler>,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            waiting: AtomicUsize::new(0),
            queue_depth,
            wait_timeout,
            next,
        }
    }

    /// Requests currently queued for a permit.
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }
}

struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl Handler for BacklogThrottle {
    async fn handle(&self, req: ProxyRequest) -> Result<CapturedResponse> {
        let _permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let queued = self.waiting.fetch_add(1, Ordering::Relaxed);
                let slot = QueueSlot(&self.waiting);
                if queued >= self.queue_depth {
                    warn!(path = %req.path, queued, "Backlog full, shedding request");
                    return Err(ProxyError::Backlog(format!(
                        "backlog queue full ({} waiting)",
                        queued
                    )));
                }
                match timeout(self.wait_timeout, self.permits.clone().acquire_owned()).await {
                    Ok(Ok(permit)) => {
                        drop(slot);
                        permit
                    }
                    Ok(Err(_)) => {
                        return Err(ProxyError::Backlog(
                            "request limiter closed".to_string(),
                        ));
                    }
                    Err(_) => {
                        warn!(path = %req.path, "Timed out waiting for a permit");
                        return Err(ProxyError::Backlog(format!(
                            "waited {:?} without a free slot",
                            self.wait_timeout
                        )));
                    }
                }
            }
        };
        self.next.handle(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::{HeaderMap, Method, StatusCode};
    use tokio::sync::Notify;

    /// Next stage that parks until released, counting entries.
    struct BlockingNext {
        release: Notify,
        entered: AtomicUsize,
    }

    #[async_trait]
    impl Handler for BlockingNext {
        async fn handle(&self, _req: ProxyRequest) -> Result<CapturedResponse> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(CapturedResponse::with_status(StatusCode::OK))
        }
    }

    fn request() -> ProxyRequest {
        ProxyRequest {
            method: Method::GET,
            path: "/x".to_string(),
            query: None,
            host: "example.com".to_string(),
            headers: HeaderMap::new(),
        }
    }

    #[tokio::test]
    async fn test_requests_inside_limit_pass() {
        let next = Arc::new(BlockingNext {
            release: Notify::new(),
            entered: AtomicUsize::new(0),
        });
        let throttle = Arc::new(BacklogThrottle::new(
            2,
            2,
            Duration::from_secs(1),
            next.clone(),
        ));

        let handle = tokio::spawn({
            let throttle = throttle.clone();
            async move { throttle.handle(request()).await }
        });
        tokio::task::yield_now().await;
        next.release.notify_one();
        assert_eq!(handle.await.unwrap().unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_overflow_beyond_queue_is_shed() {
        let next = Arc::new(BlockingNext {
            release: Notify::new(),
            entered: AtomicUsize::new(0),
        });
        let throttle = Arc::new(BacklogThrottle::new(
            1,
            0,
            Duration::from_millis(50),
            next.clone(),
        ));

        // Occupy the single permit.
        let occupant = tokio::spawn({
            let throttle = throttle.clone();
            async move { throttle.handle(request()).await }
        });
        while next.entered.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // Zero queue depth means the next request is shed immediately.
        let err = throttle.handle(request()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Backlog(_)));

        next.release.notify_one();
        assert!(occupant.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_queued_request_times_out() {
        let next = Arc::new(BlockingNext {
            release: Notify::new(),
            entered: AtomicUsize::new(0),
        });
        let throttle = Arc::new(BacklogThrottle::new(
            1,
            4,
            Duration::from_millis(20),
            next.clone(),
        ));

        let occupant = tokio::spawn({
            let throttle = throttle.clone();
            async move { throttle.handle(request()).await }
        });
        while next.entered.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let err = throttle.handle(request()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Backlog(_)));
        assert_eq!(throttle.queued(), 0);

        next.release.notify_one();
        assert!(occupant.await.unwrap().is_ok());
    }
}
