//! The contract between the gateway and the application behind it.
//!
//! The gateway never interprets payloads. For every new session it asks a
//! [`HandlerFactory`] for a dedicated [`SessionHandler`], hands it a
//! [`SessionLink`], and from then on forwards every request of that session
//! to the same instance.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use crate::http::response::BoxError;
use crate::http::{Request, Response};
use crate::session::{RemovalReason, SessionLink};

/// Future returned by [`SessionHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Response, HandlerError>> + Send + 'a>>;

/// Failure reported by a handler. The client only ever sees a generic 500.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Message(String),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] BoxError),
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// One handler instance per session.
///
/// Requests of a session are delivered in the order they arrive on their
/// connection; requests of the same session arriving on different
/// connections may run concurrently.
pub trait SessionHandler: Send + Sync + 'static {
    /// Produces the response for one request.
    fn handle(&self, request: Request) -> HandlerFuture<'_>;

    /// Called once after the session left the registry.
    ///
    /// Dropping any [`EventSender`](crate::http::EventSender) held for the
    /// session here ends its open event streams.
    fn closed(&self, reason: RemovalReason) {
        let _ = reason;
    }
}

/// Builds a fresh [`SessionHandler`] for every session handshake.
///
/// Implemented for any `Fn(SessionLink) -> H` closure.
///
/// # Examples
///
/// ```rust,no_run
/// use sessiongate::handler::{HandlerFuture, SessionHandler};
/// use sessiongate::http::{Request, Response, StatusCode};
/// use sessiongate::session::SessionLink;
///
/// struct Echo(SessionLink);
///
/// impl SessionHandler for Echo {
///     fn handle(&self, request: Request) -> HandlerFuture<'_> {
///         Box::pin(async move {
///             self.0.establish();
///             Ok(Response::new(StatusCode::Ok).body_bytes(request.body().clone()))
///         })
///     }
/// }
///
/// let factory = |link: SessionLink| Echo(link);
/// # let _ = factory;
/// ```
pub trait HandlerFactory: Send + Sync + 'static {
    fn create(&self, link: SessionLink) -> Arc<dyn SessionHandler>;
}

impl<F, H> HandlerFactory for F
where
    F: Fn(SessionLink) -> H + Send + Sync + 'static,
    H: SessionHandler,
{
    fn create(&self, link: SessionLink) -> Arc<dyn SessionHandler> {
        Arc::new((self)(link))
    }
}
