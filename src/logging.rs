//! Logging Module
//!
//! Wires up the tracing subscriber: compact console output always, plus an
//! optional daily-rotated application log file.

use crate::config::LoggingConfig;
use crate::{ProxyError, Result};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub struct LoggerManager {
    config: LoggingConfig,
    // Held for the process lifetime so buffered file output is flushed.
    _file_guard: Option<WorkerGuard>,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig) -> Self {
        Self {
            config,
            _file_guard: None,
        }
    }

    /// Initialize the logging system.
    pub fn initialize(&mut self) -> Result<()> {
        // Config log_level applies unless RUST_LOG overrides it.
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.level));

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        let file_layer = if self.config.file_enabled {
            std::fs::create_dir_all(&self.config.directory).map_err(|e| {
                ProxyError::Io(format!(
                    "Failed to create log directory {}: {}",
                    self.config.directory, e
                ))
            })?;
            let appender = RollingFileAppender::new(
                Rotation::DAILY,
                &self.config.directory,
                format!("{}.log", self.config.file_prefix),
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            self._file_guard = Some(guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .with_level(true)
                    .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                    .compact(),
            )
        } else {
            None
        };

        // Already-set subscriber is fine, happens in tests.
        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init();

        match result {
            Ok(()) => {
                info!("Logging initialized at level '{}'", self.config.level);
                if self.config.file_enabled {
                    info!("Application logs written to {}", self.config.directory);
                }
            }
            Err(_) => {
                debug!("Tracing subscriber already initialized, skipping");
            }
        }
        Ok(())
    }
}
