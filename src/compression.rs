//! Response compression.
//!
//! Gzip-compresses buffered response bodies when the client advertises
//! support, the payload is worth the CPU, and the content type is text-like.
//! Applied at the server boundary after the middleware chain so cached
//! entries always hold the identity encoding.

use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::header::{
    HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, VARY,
};
use hyper::HeaderMap;
use std::io::Write;
use tracing::debug;

use crate::capture::CapturedResponse;
use crate::config::CompressionConfig;

pub struct Compressor {
    min_size: usize,
    level: Compression,
    content_types: Vec<String>,
}

impl Compressor {
    pub fn from_config(config: &CompressionConfig) -> Self {
        Self {
            min_size: config.min_size,
            level: Compression::new(config.level.min(9)),
            content_types: config.content_types.clone(),
        }
    }

    fn client_accepts_gzip(request_headers: &HeaderMap) -> bool {
        request_headers
            .get_all(ACCEPT_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| {
                let token = token.trim();
                token == "gzip" || token.starts_with("gzip;")
            })
    }

    fn compressible_type(&self, response: &CapturedResponse) -> bool {
        let Some(value) = response.unique_header_value(&CONTENT_TYPE) else {
            return false;
        };
        let Ok(content_type) = value.to_str() else {
            return false;
        };
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        self.content_types.iter().any(|t| t == &essence)
    }

    fn should_compress(&self, request_headers: &HeaderMap, response: &CapturedResponse) -> bool {
        response.body().len() >= self.min_size
            && response.header_values(&CONTENT_ENCODING).is_empty()
            && Self::client_accepts_gzip(request_headers)
            && self.compressible_type(response)
    }

    /// Gzips the response body in place when it qualifies. `Vary:
    /// Accept-Encoding` is set either way so intermediaries key correctly.
    pub fn apply(&self, request_headers: &HeaderMap, response: &mut CapturedResponse) {
        response.append_header(VARY, HeaderValue::from_static("Accept-Encoding"));
        if !self.should_compress(request_headers, response) {
            return;
        }

        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        if encoder.write_all(response.body()).is_err() {
            return;
        }
        let compressed = match encoder.finish() {
            Ok(compressed) => compressed,
            Err(_) => return,
        };
        debug!(
            original = response.body().len(),
            compressed = compressed.len(),
            "Compressed response body"
        );

        response.remove_header(&CONTENT_LENGTH);
        response.append_header(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        response.set_body(compressed.into());
    }
}
