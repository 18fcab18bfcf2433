//! Per-connection state and the request loop that drives it.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use super::emitter;
use crate::config::GatewayConfig;
use crate::handler::{HandlerError, HandlerFactory, SessionHandler};
use crate::http::{Framer, Request, Response};
use crate::router::{BasePath, Route, SessionRouter};
use crate::session::SessionRegistry;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Process-unique identifier of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Peer resets and half-closed sockets are routine, not application errors.
pub(crate) fn is_benign(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

pub(crate) fn log_socket_error(id: ConnectionId, err: &io::Error) {
    if is_benign(err) {
        debug!(connection = %id, error = %err, "peer went away");
    } else {
        warn!(connection = %id, error = %err, "socket error");
    }
}

/// The write side of a connection, guarded by an `ended` flag.
///
/// Once ended, every write is a silent no-op. A write error ends the
/// connection too.
pub(crate) struct Connection<W> {
    id: ConnectionId,
    writer: W,
    ended: bool,
    closed: bool,
}

impl<W> Connection<W>
where
    W: AsyncWrite + Unpin,
{
    pub(crate) fn new(id: ConnectionId, writer: W) -> Self {
        Self {
            id,
            writer,
            ended: false,
            closed: false,
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended
    }

    pub(crate) fn is_writable(&self) -> bool {
        !self.ended
    }

    /// Returns `false` if nothing was written.
    pub(crate) async fn write_all(&mut self, bytes: &[u8]) -> bool {
        if self.ended {
            return false;
        }
        match self.writer.write_all(bytes).await {
            Ok(()) => true,
            Err(err) => {
                log_socket_error(self.id, &err);
                self.destroy();
                false
            }
        }
    }

    pub(crate) async fn flush(&mut self) -> bool {
        if self.ended {
            return false;
        }
        match self.writer.flush().await {
            Ok(()) => true,
            Err(err) => {
                log_socket_error(self.id, &err);
                self.destroy();
                false
            }
        }
    }

    /// Marks the connection ended, then flushes and shuts down the write side.
    ///
    /// Safe to call repeatedly; only the first call touches the socket.
    pub(crate) async fn finish(&mut self) {
        self.ended = true;
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.writer.flush().await {
            log_socket_error(self.id, &err);
            return;
        }
        if let Err(err) = self.writer.shutdown().await {
            log_socket_error(self.id, &err);
        }
    }

    /// Ends the connection without flushing.
    pub(crate) fn destroy(&mut self) {
        self.ended = true;
        self.closed = true;
    }
}

/// Drives the framer → router → handler → emitter pipeline for each
/// accepted connection.
///
/// One supervisor is shared by every connection task of a gateway.
pub struct ConnectionSupervisor {
    router: SessionRouter,
    base: BasePath,
    max_request_bytes: usize,
}

impl ConnectionSupervisor {
    /// Wires a router for `factory` onto `registry` using the settings in `config`.
    pub fn new(config: &GatewayConfig, registry: SessionRegistry, factory: Arc<dyn HandlerFactory>) -> Self {
        Self {
            router: SessionRouter::new(registry, factory, config.session_header.as_str()),
            base: BasePath::new(&config.base_path),
            max_request_bytes: config.max_request_bytes,
        }
    }

    pub fn router(&self) -> &SessionRouter {
        &self.router
    }

    /// Serves one connection until the peer leaves, a response closes it, or
    /// the socket fails.
    ///
    /// Never returns an error: every failure is logged and turned into a
    /// response or a teardown.
    pub async fn serve<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let id = ConnectionId::next();
        let (mut reader, writer) = tokio::io::split(stream);
        let mut conn = Connection::new(id, writer);
        let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
        let mut framer = Framer::new();
        debug!(connection = %id, %peer, "connection opened");

        loop {
            while conn.is_writable() {
                let Some(request) = framer.next_request(&mut buf) else {
                    break;
                };
                self.dispatch(&mut conn, &mut reader, request).await;
            }
            if conn.is_ended() {
                break;
            }

            // Guard against excessively large requests.
            if buf.len() > self.max_request_bytes {
                warn!(connection = %id, %peer, buffered = buf.len(), "request too large, sending 413");
                emitter::emit(&mut conn, &mut reader, emitter::payload_too_large(), false).await;
                break;
            }

            match reader.read_buf(&mut buf).await {
                Ok(0) => {
                    debug!(connection = %id, %peer, "connection closed by peer");
                    conn.finish().await;
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    log_socket_error(id, &err);
                    conn.destroy();
                    break;
                }
            }
        }

        buf.clear();
        debug!(connection = %id, %peer, "connection finished");
    }

    async fn dispatch<W, R>(&self, conn: &mut Connection<W>, reader: &mut R, request: Request)
    where
        W: AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        let keep_alive = request.is_keep_alive();

        if !self.base.contains(request.path()) {
            debug!(connection = %conn.id(), path = %request.path(), "path outside base, sending 404");
            emitter::emit(conn, reader, emitter::not_found(), keep_alive).await;
            return;
        }

        debug!(
            connection = %conn.id(),
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let outcome = match self.router.resolve(&request, conn.id()) {
            Route::Unknown(session) => {
                info!(connection = %conn.id(), %session, "request for unknown session, sending 409");
                Ok(emitter::unknown_session())
            }
            Route::Existing(binding) => invoke(&binding.handler, request).await,
            Route::New { pending, handler } => match invoke(&handler, request).await {
                Ok(mut response) => {
                    if let Some(session) = self.router.promote(pending, handler) {
                        response.add_header(self.router.header_name(), session.as_str());
                    }
                    Ok(response)
                }
                Err(err) => Err(err),
            },
        };

        match outcome {
            Ok(response) => emitter::emit(conn, reader, response, keep_alive).await,
            Err(err) => {
                error!(connection = %conn.id(), error = %err, "handler failed");
                if conn.is_writable() {
                    emitter::emit(conn, reader, emitter::internal_error(), keep_alive).await;
                } else {
                    conn.destroy();
                }
            }
        }
    }
}

async fn invoke(handler: &Arc<dyn SessionHandler>, request: Request) -> Result<Response, HandlerError> {
    match AssertUnwindSafe(handler.handle(request)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(HandlerError::msg("handler panicked")),
    }
}
