//! Response serialization onto a [`Connection`].
//!
//! Buffered responses get a `Content-Length` and honour the request's
//! keep-alive choice. Event streams get no length and caching disabled. They
//! end the connection once the producer is done, since nothing else delimits
//! their body, or as soon as the peer hangs up.

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, warn};

use super::connection::{Connection, log_socket_error};
use crate::http::response::BoxError;
use crate::http::{Body, BodyStream, Headers, Response, StatusCode};

/// Headers the emitter computes itself; handler-supplied values are dropped.
const FRAMING_HEADERS: [&str; 3] = ["content-length", "connection", "transfer-encoding"];

/// JSON-RPC error code returned for unknown or expired sessions.
pub const SESSION_NOT_FOUND_CODE: i64 = -32001;

const INTERNAL_ERROR_BODY: &str = "Internal Server Error";

/// Scratch space for reads that only watch for the peer leaving.
const WATCH_BUF_SIZE: usize = 512;

/// Writes `response` to `conn`.
///
/// `keep_alive` is the request's own choice and only applies to buffered
/// responses. `reader` is the connection's read half; event streams poll it
/// so a peer that hangs up mid-stream ends the pump. Writing to an ended
/// connection is a silent no-op.
pub(crate) async fn emit<W, R>(conn: &mut Connection<W>, reader: &mut R, response: Response, keep_alive: bool)
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let event_stream = response.is_event_stream();
    let (status, headers, body) = response.into_parts();

    match (body, event_stream) {
        (Body::Stream(stream), true) => emit_stream(conn, reader, status, headers, stream).await,
        (Body::Full(bytes), true) => {
            let single = futures_util::stream::once(async move { Ok::<_, BoxError>(bytes) });
            emit_stream(conn, reader, status, headers, Box::pin(single)).await;
        }
        (Body::Full(bytes), false) => emit_buffered(conn, status, headers, bytes, keep_alive).await,
        (Body::Stream(stream), false) => match collect(stream).await {
            Ok(bytes) => emit_buffered(conn, status, headers, bytes, keep_alive).await,
            Err(error) => {
                warn!(connection = %conn.id(), %error, "response body failed before it was sent");
                let body = Bytes::from_static(INTERNAL_ERROR_BODY.as_bytes());
                emit_buffered(conn, StatusCode::InternalServerError, Headers::new(), body, keep_alive).await;
            }
        },
    }
}

async fn emit_buffered<W>(
    conn: &mut Connection<W>,
    status: StatusCode,
    mut headers: Headers,
    body: Bytes,
    keep_alive: bool,
) where
    W: AsyncWrite + Unpin,
{
    strip_framing(&mut headers);
    if !body.is_empty() && !headers.contains("content-type") {
        headers.insert("Content-Type", "text/plain; charset=utf-8");
    }
    headers.insert("Connection", if keep_alive { "keep-alive" } else { "close" });
    // Content-Length is always the last header before the blank line
    headers.insert("Content-Length", body.len().to_string());

    let mut buf = encode_head(status, &headers, body.len());
    buf.put(body);

    if !conn.write_all(&buf).await {
        return;
    }
    if keep_alive {
        conn.flush().await;
    } else {
        conn.finish().await;
    }
}

async fn emit_stream<W, R>(
    conn: &mut Connection<W>,
    reader: &mut R,
    status: StatusCode,
    mut headers: Headers,
    mut stream: BodyStream,
) where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    strip_framing(&mut headers);
    headers.set("Cache-Control", "no-cache");
    headers.insert("Connection", "keep-alive");

    let head = encode_head(status, &headers, 0);
    if !conn.write_all(&head).await || !conn.flush().await {
        return;
    }

    let mut chunks = 0usize;
    let mut scratch = [0u8; WATCH_BUF_SIZE];
    while conn.is_writable() {
        tokio::select! {
            next = stream.next() => match next {
                Some(Ok(chunk)) => {
                    if !conn.write_all(&chunk).await || !conn.flush().await {
                        break;
                    }
                    chunks += 1;
                }
                Some(Err(error)) => {
                    warn!(connection = %conn.id(), %error, "event stream producer failed");
                    break;
                }
                None => break,
            },
            read = reader.read(&mut scratch) => match read {
                Ok(0) => {
                    debug!(connection = %conn.id(), chunks, "peer left during event stream");
                    conn.destroy();
                }
                // Anything pipelined behind a stream is dropped with the connection.
                Ok(_) => {}
                Err(err) => {
                    log_socket_error(conn.id(), &err);
                    conn.destroy();
                }
            },
        }
    }

    // Dropping the body closes the producer's channel.
    drop(stream);
    debug!(connection = %conn.id(), chunks, "event stream finished");
    conn.finish().await;
}

async fn collect(mut stream: BodyStream) -> Result<Bytes, BoxError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.put(chunk?);
    }
    Ok(buf.freeze())
}

fn strip_framing(headers: &mut Headers) {
    for name in FRAMING_HEADERS {
        headers.remove(name);
    }
}

fn encode_head(status: StatusCode, headers: &Headers, body_len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(128 + headers.len() * 64 + body_len);
    buf.put(format!("HTTP/1.1 {} {}\r\n", status.as_u16(), status.canonical_reason()).as_bytes());
    buf.put(headers.to_string().as_bytes());
    buf.put(&b"\r\n"[..]);
    buf
}

/// Plain-text 404 for paths outside the base path.
pub fn not_found() -> Response {
    Response::new(StatusCode::NotFound).body("Not Found")
}

/// Structured 409 for a session id the registry does not know.
pub fn unknown_session() -> Response {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "error": {
            "code": SESSION_NOT_FOUND_CODE,
            "message": "Session not found",
        },
        "id": null,
    });
    Response::new(StatusCode::Conflict)
        .header("Content-Type", "application/json")
        .body(body.to_string())
}

/// Generic 500 that reveals nothing about the failure.
pub fn internal_error() -> Response {
    Response::new(StatusCode::InternalServerError).body(INTERNAL_ERROR_BODY)
}

pub fn payload_too_large() -> Response {
    Response::new(StatusCode::PayloadTooLarge).body("Request entity too large")
}
