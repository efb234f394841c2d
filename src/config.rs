//! Configuration Module
//!
//! Handles configuration loading from YAML files, environment variables, and
//! command-line arguments, in that precedence order.

use crate::{ProxyError, Result};
use clap::{Arg, Command};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Custom deserializer for Duration from string format like "30s", "5m", "1h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs_f64()))
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        let mut num_end = 0;
        for (i, c) in s.chars().enumerate() {
            if c.is_ascii_digit() || c == '.' {
                num_end = i + 1;
            } else {
                break;
            }
        }
        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let value: f64 = s[..num_end]
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", &s[..num_end], e))?;
        let duration = match s[num_end..].trim() {
            "ms" | "millis" | "millisecond" | "milliseconds" => {
                Duration::from_secs_f64(value / 1000.0)
            }
            "" | "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs_f64(value),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs_f64(value * 60.0),
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs_f64(value * 3600.0),
            unit => return Err(format!("Unknown duration unit: {}", unit)),
        };
        Ok(duration)
    }
}

/// Listener and request-handling limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Hard ceiling on requests proxied concurrently
    pub max_concurrent_requests: usize,
    /// Requests allowed to queue for a free slot before 503
    pub backlog_queue_depth: usize,
    #[serde(with = "duration_serde")]
    pub backlog_wait_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub backend_request_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub shutdown_grace_period: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            max_concurrent_requests: 256,
            backlog_queue_depth: 512,
            backlog_wait_timeout: Duration::from_secs(5),
            backend_request_timeout: Duration::from_secs(30),
            shutdown_grace_period: Duration::from_secs(30),
        }
    }
}

/// Storage backend the proxy fronts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Storage account name, becomes the leftmost endpoint label
    pub storage_account: String,
    /// Container holding the site objects
    pub container: String,
    /// Endpoint domain the account is joined onto, e.g. blob.core.windows.net
    pub endpoint_domain: String,
    /// Response header carrying the object checksum
    pub checksum_header: String,
    /// Skip backend TLS certificate verification. Test endpoints only.
    pub insecure_skip_verify: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            storage_account: String::new(),
            container: String::new(),
            endpoint_domain: "blob.core.windows.net".to_string(),
            checksum_header: "content-md5".to_string(),
            insecure_skip_verify: false,
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.storage_account.is_empty() {
            return Err("backend.storage_account must be set".to_string());
        }
        if self.container.is_empty() {
            return Err("backend.container must be set".to_string());
        }
        if self.endpoint_domain.is_empty() {
            return Err("backend.endpoint_domain must be set".to_string());
        }
        if self.checksum_header.is_empty()
            || hyper::header::HeaderName::try_from(self.checksum_header.as_str()).is_err()
        {
            return Err(format!(
                "backend.checksum_header '{}' is not a valid header name",
                self.checksum_header
            ));
        }
        Ok(())
    }
}

/// Host-based routing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Public base domain served by this proxy
    pub base_domain: String,
    /// Environment used when the bare base domain is requested
    pub default_environment: String,
    /// Map the subdomain label onto a path prefix
    pub subdomain_rewrite_enabled: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            base_domain: String::new(),
            default_environment: "production".to_string(),
            subdomain_rewrite_enabled: true,
        }
    }
}

impl RoutingConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.subdomain_rewrite_enabled && self.base_domain.is_empty() {
            return Err("routing.base_domain must be set when subdomain rewriting is enabled".to_string());
        }
        if self.subdomain_rewrite_enabled && self.default_environment.is_empty() {
            return Err("routing.default_environment must be set".to_string());
        }
        Ok(())
    }
}

/// Asset redirect
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectConfig {
    pub enabled: bool,
    /// Extensions answered with 302 to the backend instead of proxied
    pub asset_extensions: Vec<String>,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            asset_extensions: vec![
                "mp4".to_string(),
                "webm".to_string(),
                "zip".to_string(),
                "tar".to_string(),
                "gz".to_string(),
                "iso".to_string(),
            ],
        }
    }
}

/// Response cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// How long a validated entry is served without re-probing the backend
    #[serde(with = "duration_serde")]
    pub freshness_window: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            freshness_window: Duration::from_secs(60),
        }
    }
}

/// Cross-origin resource sharing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    #[serde(with = "duration_serde")]
    pub max_age: Duration,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: vec!["*".to_string()],
            allowed_methods: vec!["GET".to_string(), "HEAD".to_string(), "OPTIONS".to_string()],
            allowed_headers: vec!["content-type".to_string(), "range".to_string()],
            max_age: Duration::from_secs(600),
        }
    }
}

/// Response compression
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Bodies smaller than this are never compressed
    pub min_size: usize,
    /// Gzip level, 0-9
    pub level: u32,
    pub content_types: Vec<String>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size: 1024,
            level: 6,
            content_types: vec![
                "text/html".to_string(),
                "text/css".to_string(),
                "text/plain".to_string(),
                "application/javascript".to_string(),
                "application/json".to_string(),
                "image/svg+xml".to_string(),
            ],
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter, e.g. "info" or "blob_proxy=debug"
    pub level: String,
    /// Also write logs to a daily-rotated file
    pub file_enabled: bool,
    pub directory: String,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_enabled: false,
            directory: "./logs".to_string(),
            file_prefix: "blob-proxy".to_string(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub routing: RoutingConfig,
    pub redirect: RedirectConfig,
    pub cache: CacheConfig,
    pub cors: CorsConfig,
    pub compression: CompressionConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(std::env::args_os())
    }

    /// Same as [`Config::load`] but with explicit argv, for tests.
    pub fn load_from<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = Self::build_cli().get_matches_from(args);

        let mut config = if let Some(config_path) = matches.get_one::<String>("config") {
            Self::load_from_file(config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(&matches);

        config.backend.validate().map_err(|e| {
            ProxyError::Config(format!("Invalid backend configuration: {}", e))
        })?;
        config.routing.validate().map_err(|e| {
            ProxyError::Config(format!("Invalid routing configuration: {}", e))
        })?;

        if config.backend.insecure_skip_verify {
            warn!("backend.insecure_skip_verify is enabled; backend certificates are NOT verified");
        }
        info!(
            "Serving {}.{}/{} on {}:{}",
            config.backend.storage_account,
            config.backend.endpoint_domain,
            config.backend.container,
            config.server.bind_address,
            config.server.port
        );
        debug!("Configuration: {:?}", config);

        Ok(config)
    }

    /// Build CLI argument parser
    fn build_cli() -> Command {
        Command::new("blob-proxy")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Reverse proxy mapping subdomains of a public host to blob storage containers")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .value_name("PORT")
                    .help("Listen port (default: 8080)"),
            )
            .arg(
                Arg::new("bind-address")
                    .long("bind-address")
                    .value_name("ADDR")
                    .help("Listen address (default: 0.0.0.0)"),
            )
            .arg(
                Arg::new("storage-account")
                    .long("storage-account")
                    .value_name("NAME")
                    .help("Storage account name"),
            )
            .arg(
                Arg::new("container")
                    .long("container")
                    .value_name("NAME")
                    .help("Storage container name"),
            )
            .arg(
                Arg::new("base-domain")
                    .long("base-domain")
                    .value_name("DOMAIN")
                    .help("Public base domain served by the proxy"),
            )
            .arg(
                Arg::new("default-environment")
                    .long("default-environment")
                    .value_name("NAME")
                    .help("Environment used for the bare base domain"),
            )
            .arg(
                Arg::new("insecure-skip-verify")
                    .long("insecure-skip-verify")
                    .action(clap::ArgAction::SetTrue)
                    .help("Skip backend TLS certificate verification (test endpoints only)"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level filter (default: info)"),
            )
    }

    /// Load configuration from YAML file
    fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("Failed to read config file {}: {}", path, e))
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            ProxyError::Config(format!("Failed to parse config file {}: {}", path, e))
        })?;
        info!("Configuration loaded from file: {}", path);
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("PROXY_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(addr) = std::env::var("PROXY_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }
        if let Ok(account) = std::env::var("STORAGE_ACCOUNT") {
            self.backend.storage_account = account;
        }
        if let Ok(container) = std::env::var("STORAGE_CONTAINER") {
            self.backend.container = container;
        }
        if let Ok(domain) = std::env::var("BASE_DOMAIN") {
            self.routing.base_domain = domain;
        }
        if let Ok(environment) = std::env::var("DEFAULT_ENVIRONMENT") {
            self.routing.default_environment = environment;
        }
        if let Ok(skip) = std::env::var("INSECURE_SKIP_VERIFY") {
            self.backend.insecure_skip_verify = skip == "true" || skip == "1";
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(window) = std::env::var("CACHE_FRESHNESS_WINDOW") {
            match duration_serde::parse_duration(&window) {
                Ok(window) => self.cache.freshness_window = window,
                Err(e) => warn!("Ignoring invalid CACHE_FRESHNESS_WINDOW: {}", e),
            }
        }
        if let Ok(max) = std::env::var("MAX_CONCURRENT_REQUESTS") {
            if let Ok(max) = max.parse() {
                self.server.max_concurrent_requests = max;
            }
        }
    }

    /// Apply command line overrides
    fn apply_cli_overrides(&mut self, matches: &clap::ArgMatches) {
        if let Some(port) = matches.get_one::<String>("port") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Some(addr) = matches.get_one::<String>("bind-address") {
            self.server.bind_address = addr.clone();
        }
        if let Some(account) = matches.get_one::<String>("storage-account") {
            self.backend.storage_account = account.clone();
        }
        if let Some(container) = matches.get_one::<String>("container") {
            self.backend.container = container.clone();
        }
        if let Some(domain) = matches.get_one::<String>("base-domain") {
            self.routing.base_domain = domain.clone();
        }
        if let Some(environment) = matches.get_one::<String>("default-environment") {
            self.routing.default_environment = environment.clone();
        }
        if matches.get_flag("insecure-skip-verify") {
            self.backend.insecure_skip_verify = true;
        }
        if let Some(level) = matches.get_one::<String>("log-level") {
            self.logging.level = level.clone();
        }
    }

    /// Header name for the configured checksum header.
    pub fn checksum_header(&self) -> Result<hyper::header::HeaderName> {
        hyper::header::HeaderName::try_from(self.backend.checksum_header.as_str()).map_err(|e| {
            ProxyError::Config(format!(
                "invalid checksum header '{}': {}",
                self.backend.checksum_header, e
            ))
        })
    }
}
