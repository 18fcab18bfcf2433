//! Normalized response returned by session handlers.
//!
//! A response is either buffered ([`Body::Full`]) or produced incrementally
//! ([`Body::Stream`]). Wire serialization, including `Content-Length` and
//! `Connection`, is the emitter's job, not the handler's.

use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use serde::Serialize;

use super::{EVENT_STREAM, Headers, StatusCode};

/// Boxed error type produced by streaming bodies and handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A pinned, boxed producer of body chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send + 'static>>;

/// Response payload.
pub enum Body {
    /// A complete body, sent with a `Content-Length`.
    Full(Bytes),
    /// Chunks forwarded verbatim as the producer yields them.
    Stream(BodyStream),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::Full(Bytes::new())
    }
}

/// An HTTP response as seen by handlers.
///
/// # Examples
///
/// ```
/// use sessiongate::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .json(&serde_json::json!({"jsonrpc": "2.0", "result": {}, "id": 1}))
///     .unwrap();
///
/// assert_eq!(response.headers().get("content-type"), Some("application/json"));
/// assert!(!response.is_event_stream());
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::default(),
        }
    }

    /// Appends a response header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in place.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Full(Bytes::from(body.into()));
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Full(body.into());
        self
    }

    /// Serializes `value` as the body and declares `application/json`.
    ///
    /// # Errors
    ///
    /// Returns the [`serde_json::Error`] if `value` cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        self.headers.set("Content-Type", "application/json");
        self.body = Body::Full(Bytes::from(body));
        Ok(self)
    }

    /// Uses `stream` as the body.
    ///
    /// The emitter only streams when the content type is `text/event-stream`;
    /// any other streamed body is collected and sent with a length.
    #[must_use]
    pub fn stream<S>(mut self, stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    {
        self.body = Body::Stream(Box::pin(stream));
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

    /// Returns the response body.
    pub fn body_ref(&self) -> &Body {
        &self.body
    }

    /// Returns `true` when the declared content type is an event stream.
    pub fn is_event_stream(&self) -> bool {
        self.headers.get("content-type").is_some_and(|ct| {
            ct.split(';')
                .next()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(EVENT_STREAM))
        })
    }

    /// Splits the response into its parts.
    pub fn into_parts(self) -> (StatusCode, Headers, Body) {
        (self.status, self.headers, self.body)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}
