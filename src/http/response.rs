//! HTTP response builder.
//!
//! Provides a fluent builder API for origin handlers plus the in-place
//! accessors the cache middleware needs to decorate responses and to turn
//! them into stored entries and back.

use bytes::Bytes;

use super::{Headers, StatusCode};

/// An HTTP response produced by an origin handler or served from cache.
///
/// # Examples
///
/// ```
/// use rttp_cache::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Cache-Control", "max-age=60")
///     .header("Surrogate-Key", "products, product-42")
///     .body(r#"{"status":"ok"}"#);
///
/// assert_eq!(response.headers().get("cache-control"), Some("max-age=60"));
/// assert_eq!(response.body_ref().len(), 15);
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Reassembles a response from its parts, e.g. a stored cache entry.
    pub fn from_parts(status: StatusCode, headers: Headers, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place. Intended for middleware pipelines that receive
    /// a `Response` from downstream and need to decorate it without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Bytes::from(body.into());
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the response headers for in-place mutation.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the body. Cloning the returned [`Bytes`] is cheap.
    pub fn body_ref(&self) -> &Bytes {
        &self.body
    }

    /// Splits the response into status, headers and body.
    pub fn into_parts(self) -> (StatusCode, Headers, Bytes) {
        (self.status, self.headers, self.body)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_headers_and_body() {
        let r = Response::new(StatusCode::Ok)
            .header("X-Request-Id", "abc-123")
            .body("Hello");
        assert_eq!(r.headers().get("x-request-id"), Some("abc-123"));
        assert_eq!(r.body_ref().as_ref(), b"Hello");
    }

    #[test]
    fn parts_round_trip() {
        let r = Response::new(StatusCode::NotFound)
            .header("Cache-Control", "max-age=10")
            .body("missing");
        let (status, headers, body) = r.into_parts();
        let rebuilt = Response::from_parts(status, headers, body);
        assert_eq!(rebuilt.status(), StatusCode::NotFound);
        assert_eq!(rebuilt.headers().get("cache-control"), Some("max-age=10"));
        assert_eq!(rebuilt.body_ref().as_ref(), b"missing");
    }

    #[test]
    fn headers_mut_decorates_in_place() {
        let mut r = Response::default();
        r.headers_mut().set("Age", "4");
        r.add_header("Vary", "Accept-Encoding");
        assert_eq!(r.headers().get("age"), Some("4"));
        assert_eq!(r.headers().len(), 2);
    }
}
