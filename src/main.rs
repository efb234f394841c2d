use blob_proxy::{
    config::Config, logging::LoggerManager, server::ProxyServer, shutdown::ShutdownCoordinator,
    Result,
};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    let mut logger = LoggerManager::new(config.logging.clone());
    logger.initialize()?;

    // Rustls needs a process-wide crypto provider before any TLS config is built.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        info!("Rustls crypto provider already installed");
    }

    info!("Starting blob-proxy v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = ShutdownCoordinator::new(config.server.shutdown_grace_period);
    let server = ProxyServer::new(&config, Arc::clone(&shutdown))?;

    let signal_coordinator = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if let Err(e) = signal_coordinator.listen_for_signals().await {
            error!("Signal listener failed: {}", e);
        }
    });

    server.run().await
}
