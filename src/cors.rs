//! Cross-origin resource sharing.
//!
//! Preflight `OPTIONS` requests are answered at the server boundary without
//! touching the backend; every other response gets the allow-origin header
//! when the caller's origin matches the policy. `Vary: Origin` is always set
//! on decorated responses so shared caches keep per-origin copies apart.

use hyper::header::{HeaderName, HeaderValue, ORIGIN, VARY};
use hyper::{Method, StatusCode};

use crate::capture::CapturedResponse;
use crate::config::CorsConfig;
use crate::handler::ProxyRequest;

const ALLOW_ORIGIN: HeaderName = HeaderName::from_static("access-control-allow-origin");
const ALLOW_METHODS: HeaderName = HeaderName::from_static("access-control-allow-methods");
const ALLOW_HEADERS: HeaderName = HeaderName::from_static("access-control-allow-headers");
const MAX_AGE: HeaderName = HeaderName::from_static("access-control-max-age");
const REQUEST_METHOD: HeaderName = HeaderName::from_static("access-control-request-method");

pub struct CorsPolicy {
    allowed_origins: Vec<String>,
    allow_any_origin: bool,
    allowed_methods: String,
    allowed_headers: String,
    max_age_secs: u64,
}

impl CorsPolicy {
    pub fn from_config(config: &CorsConfig) -> Self {
        Self {
            allow_any_origin: config.allowed_origins.iter().any(|o| o == "*"),
            allowed_origins: config.allowed_origins.clone(),
            allowed_methods: config.allowed_methods.join(", "),
            allowed_headers: config.allowed_headers.join(", "),
            max_age_secs: config.max_age.as_secs(),
        }
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.allow_any_origin || self.allowed_origins.iter().any(|o| o == origin)
    }

    fn allow_origin_value(&self, origin: &HeaderValue) -> Option<HeaderValue> {
        let origin_str = origin.to_str().ok()?;
        if !self.origin_allowed(origin_str) {
            return None;
        }
        if self.allow_any_origin {
            Some(HeaderValue::from_static("*"))
        } else {
            Some(origin.clone())
        }
    }

    /// Answers a CORS preflight directly, or returns `None` for requests
    /// that should continue down the chain.
    pub fn preflight_response(&self, req: &ProxyRequest) -> Option<CapturedResponse> {
        if req.method != Method::OPTIONS {
            return None;
        }
        let origin = req.headers.get(ORIGIN)?;
        req.headers.get(&REQUEST_METHOD)?;

        let mut response = CapturedResponse::with_status(StatusCode::NO_CONTENT);
        if let Some(allow) = self.allow_origin_value(origin) {
            response.append_header(ALLOW_ORIGIN, allow);
            if let Ok(methods) = HeaderValue::from_str(&self.allowed_methods) {
                response.append_header(ALLOW_METHODS, methods);
            }
            if !self.allowed_headers.is_empty() {
                if let Ok(headers) = HeaderValue::from_str(&self.allowed_headers) {
                    response.append_header(ALLOW_HEADERS, headers);
                }
            }
            if let Ok(age) = HeaderValue::from_str(&self.max_age_secs.to_string()) {
                response.append_header(MAX_AGE, age);
            }
        }
        response.append_header(VARY, HeaderValue::from_static("Origin"));
        Some(response)
    }

    /// Decorates an outgoing response for the given request origin.
    pub fn apply(&self, origin: Option<&HeaderValue>, response: &mut CapturedResponse) {
        let Some(origin) = origin else { return };
        if let Some(allow) = self.allow_origin_value(origin) {
            response.remove_header(&ALLOW_ORIGIN);
            response.append_header(ALLOW_ORIGIN, allow);
        }
        response.append_header(VARY, HeaderValue::from_static("Origin"));
    }
}
