//! Error Module
//!
//! Defines the error and result types used throughout the blob proxy.

use thiserror::Error;

/// Main error type for the blob proxy
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Routing rejected: {0}")]
    RoutingRejected(String),

    #[error("Backlog exceeded: {0}")]
    Backlog(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("System error: {0}")]
    System(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(err.to_string())
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::Http(err.to_string())
    }
}

impl From<hyper::http::Error> for ProxyError {
    fn from(err: hyper::http::Error) -> Self {
        ProxyError::Http(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::Config(err.to_string())
    }
}

/// Result type alias for the blob proxy
pub type Result<T> = std::result::Result<T, ProxyError>;
