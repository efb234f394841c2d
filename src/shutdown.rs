//! Graceful Shutdown Module
//!
//! Translates SIGINT/SIGTERM into a broadcast every component can subscribe
//! to, and bounds how long in-flight work gets to drain.

use crate::{ProxyError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Shutdown coordinator for graceful system shutdown
pub struct ShutdownCoordinator {
    shutdown_sender: broadcast::Sender<()>,
    grace_period: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace_period: Duration) -> Arc<Self> {
        let (shutdown_sender, _) = broadcast::channel(16);
        Arc::new(Self {
            shutdown_sender,
            grace_period,
        })
    }

    /// Receiver for components listening for the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }

    /// How long in-flight connections get to finish after the signal.
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Blocks until SIGINT or SIGTERM arrives, then broadcasts shutdown.
    pub async fn listen_for_signals(&self) -> Result<()> {
        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                ProxyError::System(format!("Failed to create SIGINT handler: {}", e))
            })?;
        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                ProxyError::System(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate();
        Ok(())
    }

    /// Broadcasts shutdown to all subscribers.
    pub fn initiate(&self) {
        if let Err(e) = self.shutdown_sender.send(()) {
            // No one listening means everything already wound down.
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }
    }
}
