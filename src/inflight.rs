//! In-flight fetch coalescing.
//!
//! Coordinates concurrent cache misses for the same backend object so only
//! one request performs the backend fetch while the others wait for its
//! result. The first registrant for a flight key becomes the fetcher and
//! holds an RAII guard; later registrants subscribe to a broadcast channel
//! and receive the fetched response directly, so even uncacheable outcomes
//! (a 404 probe, say) cost a single backend round trip.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::capture::CapturedResponse;

/// Outcome delivered to waiters. Errors travel as strings because broadcast
/// payloads must be `Clone`.
pub type FlightResult = std::result::Result<CapturedResponse, String>;

/// One pending message is all a completion notification needs.
const CHANNEL_CAPACITY: usize = 1;

/// Tracks pending backend fetches keyed by `(method, backend path)`.
#[derive(Default)]
pub struct FlightTracker {
    pending: Arc<DashMap<String, broadcast::Sender<FlightResult>>>,
}

/// Role assigned to a request after registration.
pub enum FlightRole {
    /// First request for this key; responsible for the backend fetch.
    Fetcher(FlightGuard),
    /// A fetch is already in flight; wait on the receiver for its result.
    Waiter(broadcast::Receiver<FlightResult>),
}

/// RAII guard held by the fetcher. Dropping it without completing removes
/// the key so waiters observe channel closure and fall back to their own
/// fetch instead of hanging.
pub struct FlightGuard {
    key: String,
    sender: broadcast::Sender<FlightResult>,
    pending: Arc<DashMap<String, broadcast::Sender<FlightResult>>>,
    completed: bool,
}

impl FlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a flight key, atomically deciding fetcher vs
    /// waiter.
    pub fn try_register(&self, key: &str) -> FlightRole {
        match self.pending.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
                vacant.insert(tx.clone());
                FlightRole::Fetcher(FlightGuard {
                    key: key.to_string(),
                    sender: tx,
                    pending: Arc::clone(&self.pending),
                    completed: false,
                })
            }
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                FlightRole::Waiter(occupied.get().subscribe())
            }
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.pending.len()
    }
}

impl FlightGuard {
    /// Publish the fetched response to all waiters and release the key.
    pub fn complete(mut self, response: CapturedResponse) {
        self.completed = true;
        // No receivers is fine; send errors are expected then.
        let _ = self.sender.send(Ok(response));
        self.pending.remove(&self.key);
    }

    /// Publish a fetch failure to all waiters and release the key.
    pub fn complete_error(mut self, error: String) {
        self.completed = true;
        let _ = self.sender.send(Err(error));
        self.pending.remove(&self.key);
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.pending.remove(&self.key);
        }
    }
}
