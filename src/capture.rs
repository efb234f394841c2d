//! Response capture buffer.
//!
//! An in-memory response sink that records status, headers, and body so a
//! middleware can inspect the outcome of the next stage before deciding
//! whether to replay it to the real client or discard it in favor of a retry.
//!
//! Headers are held as an ordered list rather than a map so multi-valued
//! headers replay in their original insertion order. A buffer is flushed at
//! most once; dropping it unflushed is the discard path.

use bytes::{Bytes, BytesMut};
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Response, StatusCode};

use crate::Result;

/// A buffered HTTP response captured from a downstream handler.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Bytes,
}

impl Default for CapturedResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl CapturedResponse {
    /// Create an empty buffer with a 200 status, mirroring a fresh response
    /// writer that was never explicitly given a status.
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Build a captured response from an upstream status, header sequence and
    /// collected body.
    pub fn from_parts<'a, I>(status: StatusCode, headers: I, body: Bytes) -> Self
    where
        I: IntoIterator<Item = (&'a HeaderName, &'a HeaderValue)>,
    {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(n, v)| (n.clone(), v.clone()))
                .collect(),
            body,
        }
    }

    /// Shorthand for a bodyless status response.
    pub fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            ..Self::new()
        }
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Append a header, preserving insertion order across repeated names.
    pub fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.push((name, value));
    }

    /// Remove every value of the named header.
    pub fn remove_header(&mut self, name: &HeaderName) {
        self.headers.retain(|(n, _)| n != name);
    }

    /// Append bytes to the body buffer.
    pub fn write(&mut self, chunk: &[u8]) {
        let mut body = BytesMut::from(std::mem::take(&mut self.body).as_ref());
        body.extend_from_slice(chunk);
        self.body = body.freeze();
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn headers(&self) -> &[(HeaderName, HeaderValue)] {
        &self.headers
    }

    /// All values recorded for a header name, in insertion order.
    pub fn header_values(&self, name: &HeaderName) -> Vec<&HeaderValue> {
        self.headers
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v)
            .collect()
    }

    /// The single value of a header, or `None` when the header is absent or
    /// carries more than one value.
    pub fn unique_header_value(&self, name: &HeaderName) -> Option<&HeaderValue> {
        let values = self.header_values(name);
        match values.as_slice() {
            [value] => Some(value),
            _ => None,
        }
    }

    /// Flush the buffer into a real response, consuming it. Headers are
    /// replayed first in insertion order, then the status and body are set.
    pub fn flush(self) -> Result<Response<Full<Bytes>>> {
        let mut response = Response::builder()
            .status(self.status)
            .body(Full::new(self.body))?;
        for (name, value) in self.headers {
            response.headers_mut().append(name, value);
        }
        Ok(response)
    }
}
