//! The parsed request handed to the router and to session handlers.

use bytes::Bytes;

use super::{Headers, Method};

/// A complete HTTP/1.1 request extracted by the [`Framer`](super::Framer).
///
/// Header names are stored lower-cased. The body is exactly
/// [`content_length`](Self::content_length) bytes long.
///
/// # Examples
///
/// ```
/// use bytes::BytesMut;
/// use sessiongate::http::Framer;
///
/// let mut buf = BytesMut::from(&b"POST /mcp?debug=1 HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi"[..]);
/// let request = Framer::new().next_request(&mut buf).unwrap();
///
/// assert_eq!(request.method().as_str(), "POST");
/// assert_eq!(request.path(), "/mcp");
/// assert_eq!(request.query_string(), Some("debug=1"));
/// assert_eq!(request.body().as_ref(), b"hi");
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    query: Option<String>,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// Assembles a request from already-framed parts.
    ///
    /// `target` is the raw request target; anything after the first `?` is
    /// split off into the query string.
    pub fn new(method: Method, target: &str, version: u8, headers: Headers, body: Bytes) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (target.to_owned(), None),
        };
        Self {
            method,
            path,
            query,
            version,
            headers,
            body,
        }
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Number of body bytes consumed from the stream for this request.
    pub fn content_length(&self) -> usize {
        self.body.len()
    }

    /// Returns `true` only when the client explicitly asked for `Connection: keep-alive`.
    ///
    /// The gateway closes by default, whatever the protocol version.
    pub fn is_keep_alive(&self) -> bool {
        self.headers
            .get("connection")
            .is_some_and(|conn| conn.trim().eq_ignore_ascii_case("keep-alive"))
    }

    /// Returns the non-empty value of the named header, if present.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}
