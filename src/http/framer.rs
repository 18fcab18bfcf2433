//! Incremental request framing over a per-connection byte buffer.
//!
//! The framer never fails: a head that [`httparse`] rejects is re-read by a
//! lenient line parser that falls back to safe defaults, and a stream that
//! never forms a complete request simply never yields one.

use std::str;

use bytes::BytesMut;
use tracing::trace;

use super::{Headers, Method, Request};

const SEPARATOR: &[u8] = b"\r\n\r\n";

/// Maximum number of headers the fast path accepts before falling back.
const MAX_HEADERS: usize = 64;

/// Extracts complete requests from an accumulating connection buffer.
///
/// One framer belongs to one connection. It remembers how far it has already
/// searched for the head terminator, so a head trickling in byte by byte is
/// not rescanned from the start on every read.
///
/// # Examples
///
/// ```
/// use bytes::BytesMut;
/// use sessiongate::http::Framer;
///
/// let mut framer = Framer::new();
/// let mut buf = BytesMut::from(&b"GET /mcp HTTP/1.1\r\nHost: a\r\n"[..]);
/// assert!(framer.next_request(&mut buf).is_none());
///
/// buf.extend_from_slice(b"\r\nGET /mcp/2 HTTP/1.1\r\n\r\n");
/// assert_eq!(framer.next_request(&mut buf).unwrap().path(), "/mcp");
/// assert_eq!(framer.next_request(&mut buf).unwrap().path(), "/mcp/2");
/// assert!(buf.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct Framer {
    search_from: usize,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns the next complete request at the front of `buf`.
    ///
    /// Returns `None` while the head terminator or the declared body has not
    /// fully arrived; `buf` is left untouched in that case.
    pub fn next_request(&mut self, buf: &mut BytesMut) -> Option<Request> {
        let Some(separator) = self.find_separator(buf) else {
            self.search_from = buf.len().saturating_sub(SEPARATOR.len() - 1);
            return None;
        };

        let body_start = separator + SEPARATOR.len();
        let head = parse_head(&buf[..body_start]);

        let declared = head
            .headers
            .get("content-length")
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let content_length = if head.method.ignores_declared_body() {
            0
        } else {
            declared
        };

        let Some(total) = body_start.checked_add(content_length) else {
            self.search_from = separator;
            return None;
        };
        if buf.len() < total {
            trace!(buffered = buf.len(), needed = total, "waiting for request body");
            self.search_from = separator;
            return None;
        }

        let mut frame = buf.split_to(total);
        let body = frame.split_off(body_start).freeze();
        self.search_from = 0;

        Some(Request::new(
            head.method,
            &head.target,
            head.version,
            head.headers,
            body,
        ))
    }

    fn find_separator(&self, buf: &[u8]) -> Option<usize> {
        let start = self.search_from.min(buf.len());
        buf[start..]
            .windows(SEPARATOR.len())
            .position(|window| window == SEPARATOR)
            .map(|pos| start + pos)
    }
}

struct Head {
    method: Method,
    target: String,
    version: u8,
    headers: Headers,
}

fn parse_head(head: &[u8]) -> Head {
    match parse_strict(head) {
        Some(parsed) => parsed,
        None => {
            trace!("head rejected by httparse, using lenient parser");
            parse_lenient(head)
        }
    }
}

fn parse_strict(head: &[u8]) -> Option<Head> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut raw = httparse::Request::new(&mut headers);
    match raw.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) | Err(_) => return None,
    }

    let method: Method = raw.method?.parse().unwrap_or(Method::Get);
    let target = raw.path?.to_owned();
    let version = raw.version.unwrap_or(1);

    let mut header_map = Headers::with_capacity(raw.headers.len());
    for header in raw.headers.iter() {
        if let Ok(value) = str::from_utf8(header.value) {
            header_map.insert(header.name.to_ascii_lowercase(), value.trim());
        }
    }

    Some(Head {
        method,
        target,
        version,
        headers: header_map,
    })
}

fn parse_lenient(head: &[u8]) -> Head {
    let mut lines = head
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line));

    let start_line = lines
        .next()
        .and_then(|line| str::from_utf8(line).ok())
        .unwrap_or("");
    let mut parts = start_line.split_whitespace();
    let method = parts
        .next()
        .and_then(|m| m.parse().ok())
        .unwrap_or(Method::Get);
    let target = parts.next().unwrap_or("/").to_owned();
    let version = match parts.next() {
        Some("HTTP/1.0") => 0,
        _ => 1,
    };

    let mut headers = Headers::new();
    for line in lines {
        let Ok(line) = str::from_utf8(line) else {
            continue;
        };
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        headers.insert(name.to_ascii_lowercase(), value.trim());
    }

    Head {
        method,
        target,
        version,
        headers,
    }
}
