//! Reverse proxy mapping subdomains of a public host onto paths in a blob
//! storage container, with not-found fallback routing, a checksum-validated
//! response cache, CORS, compression, and backlog throttling.

pub mod blob_client;
pub mod capture;
pub mod checksum_cache;
pub mod compression;
pub mod config;
pub mod cors;
pub mod error;
pub mod handler;
pub mod https_connector;
pub mod inflight;
pub mod logging;
pub mod path_join;
pub mod proxy;
pub mod redirect;
pub mod rewrite;
pub mod server;
pub mod shutdown;
pub mod throttle;

pub use error::{ProxyError, Result};
