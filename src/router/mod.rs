//! Session routing: decide which handler instance serves a request.
//!
//! Every in-scope request falls into exactly one of three cases, keyed on the
//! session header:
//!
//! | Header              | Outcome                                           |
//! |---------------------|---------------------------------------------------|
//! | absent              | [`Route::New`]: fresh handler on a pending session |
//! | present, registered | [`Route::Existing`]: reuse the bound handler       |
//! | present, unknown    | [`Route::Unknown`]: rejected, nothing created      |
//!
//! Requests outside the configured [`BasePath`] never reach the router.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::handler::{HandlerFactory, SessionHandler};
use crate::http::Request;
use crate::server::ConnectionId;
use crate::session::{PendingSession, SessionId, SessionLink, SessionRegistry};

/// The path prefix the gateway answers on.
///
/// A request is in scope when its path equals the base or continues it with
/// a `/`. The query string is not part of the path and never matters.
///
/// # Examples
///
/// ```
/// use sessiongate::router::BasePath;
///
/// let base = BasePath::new("/mcp/");
/// assert!(base.contains("/mcp"));
/// assert!(base.contains("/mcp/events"));
/// assert!(!base.contains("/mcpx"));
/// assert!(!base.contains("/"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasePath(String);

impl BasePath {
    /// Trailing slashes are ignored, so `/mcp/` and `/mcp` are equivalent.
    pub fn new(base: &str) -> Self {
        let trimmed = base.trim_end_matches('/');
        Self(if trimmed.is_empty() {
            "/".to_owned()
        } else {
            trimmed.to_owned()
        })
    }

    /// The normalized prefix, without a trailing slash unless it is the root.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn contains(&self, path: &str) -> bool {
        if self.0 == "/" {
            return true;
        }
        match path.strip_prefix(self.0.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// A session paired with its dedicated handler instance.
#[derive(Clone)]
pub struct HandlerBinding {
    pub link: SessionLink,
    pub handler: Arc<dyn SessionHandler>,
    /// The connection whose request created the session.
    pub origin: ConnectionId,
}

/// Outcome of [`SessionRouter::resolve`].
pub enum Route {
    Existing(HandlerBinding),
    New {
        pending: PendingSession,
        handler: Arc<dyn SessionHandler>,
    },
    Unknown(SessionId),
}

type Bindings = Arc<Mutex<HashMap<SessionId, HandlerBinding>>>;

fn lock(bindings: &Bindings) -> MutexGuard<'_, HashMap<SessionId, HandlerBinding>> {
    bindings.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Maps session headers to handler bindings.
///
/// On construction the router installs itself as the registry's removal
/// callback: whenever a session leaves the registry, for whatever reason, its
/// binding is dropped and the handler's [`closed`](SessionHandler::closed)
/// hook runs.
pub struct SessionRouter {
    registry: SessionRegistry,
    factory: Arc<dyn HandlerFactory>,
    header: String,
    bindings: Bindings,
}

impl SessionRouter {
    pub fn new(registry: SessionRegistry, factory: Arc<dyn HandlerFactory>, header: impl Into<String>) -> Self {
        let bindings: Bindings = Arc::default();
        let weak = Arc::downgrade(&bindings);
        registry.set_removal_callback(move |id, reason| {
            let Some(bindings) = weak.upgrade() else {
                return;
            };
            let binding = lock(&bindings).remove(id);
            if let Some(binding) = binding {
                debug!(session = %id, %reason, "tearing down handler binding");
                binding.handler.closed(reason);
            }
        });

        Self {
            registry,
            factory,
            header: header.into(),
            bindings,
        }
    }

    /// Name of the header that carries the session token.
    pub fn header_name(&self) -> &str {
        &self.header
    }

    /// The registry sessions are bound in.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Classifies `request`, refreshing the session's activity on a hit.
    ///
    /// A new handler instance is only built for requests without a session
    /// header; unknown ids never create any state.
    pub fn resolve(&self, request: &Request, connection: ConnectionId) -> Route {
        let Some(raw) = request.header_value(&self.header) else {
            let pending = PendingSession::new(connection, self.registry.clone());
            let handler = self.factory.create(pending.link().clone());
            return Route::New { pending, handler };
        };

        let id = SessionId::from(raw);
        if !self.registry.update_activity(&id) {
            return Route::Unknown(id);
        }
        match lock(&self.bindings).get(&id).cloned() {
            Some(binding) => Route::Existing(binding),
            None => Route::Unknown(id),
        }
    }

    /// Turns an established pending session into a bound, registered one.
    ///
    /// Returns the session id, or `None` if the handler never completed the
    /// handshake (the pending session and handler are then discarded).
    pub fn promote(&self, pending: PendingSession, handler: Arc<dyn SessionHandler>) -> Option<SessionId> {
        if !pending.link().is_established() || pending.link().is_closed() {
            return None;
        }
        let id = pending.id().clone();
        let origin = pending.connection();
        // Bind before registering so a concurrent request never sees a
        // registered id without a handler.
        lock(&self.bindings).insert(
            id.clone(),
            HandlerBinding {
                link: pending.link().clone(),
                handler,
                origin,
            },
        );
        match pending.promote() {
            Ok(_) => Some(id),
            Err(_) => {
                lock(&self.bindings).remove(&id);
                None
            }
        }
    }

    /// Number of live handler bindings.
    pub fn len(&self) -> usize {
        lock(&self.bindings).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every binding and clears the registry without running teardown hooks.
    pub fn shutdown(&self) {
        self.registry.clear();
        let drained: Vec<HandlerBinding> = lock(&self.bindings).drain().map(|(_, b)| b).collect();
        debug!(count = drained.len(), "handler bindings dropped");
    }
}
