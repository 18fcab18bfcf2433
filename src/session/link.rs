//! The handler's side channel back into the gateway, and the two-phase
//! creation of new sessions.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::{ClientInfo, SessionId, SessionRegistry};
use crate::server::ConnectionId;

#[derive(Debug, Default)]
struct LinkState {
    established: bool,
    closed: bool,
    client: Option<ClientInfo>,
}

/// Given to each handler instance when it is created.
///
/// Through the link a handler confirms the handshake that turns its pending
/// session into a registered one, reports what the client said about itself,
/// and can close its own session at any time. Closing goes through the same
/// idempotent removal path as inactivity eviction.
#[derive(Debug, Clone)]
pub struct SessionLink {
    id: SessionId,
    registry: SessionRegistry,
    state: Arc<Mutex<LinkState>>,
}

impl SessionLink {
    fn new(id: SessionId, registry: SessionRegistry) -> Self {
        Self {
            id,
            registry,
            state: Arc::new(Mutex::new(LinkState::default())),
        }
    }

    /// The token the gateway minted for this session.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Marks the handshake as complete.
    ///
    /// Once the current request returns successfully the gateway registers the
    /// session and sends its id back to the client.
    pub fn establish(&self) {
        self.state().established = true;
    }

    /// Whether the handler has completed its handshake.
    pub fn is_established(&self) -> bool {
        self.state().established
    }

    /// Records client-reported metadata and publishes it if the session is live.
    pub fn report_client(&self, client: ClientInfo) {
        self.state().client = Some(client.clone());
        if self.registry.contains(&self.id) {
            self.registry.update_client_info(&self.id, client);
        }
    }

    /// The metadata last passed to [`report_client`](Self::report_client).
    pub fn client(&self) -> Option<ClientInfo> {
        self.state().client.clone()
    }

    /// Ends the session from the handler side.
    ///
    /// Returns `true` if this call removed a registered session. Closing a
    /// session that is still pending prevents it from ever being registered.
    pub fn close(&self) -> bool {
        self.state().closed = true;
        let removed = self.registry.remove(&self.id);
        if removed {
            debug!(session = %self.id, "session closed by handler");
        }
        removed
    }

    /// Whether the session has been closed or evicted.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A session minted for a request that carried no session header.
///
/// It is keyed by the connection it arrived on and only becomes a registered
/// session through [`promote`](Self::promote), after the handler established
/// it. Dropping a pending session leaves no trace in the registry.
#[derive(Debug)]
pub struct PendingSession {
    connection: ConnectionId,
    link: SessionLink,
}

impl PendingSession {
    /// Mints a fresh id for a handshake arriving on `connection`.
    pub fn new(connection: ConnectionId, registry: SessionRegistry) -> Self {
        Self {
            connection,
            link: SessionLink::new(SessionId::generate(), registry),
        }
    }

    /// The connection the handshake arrived on.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// The token reserved for the session being set up.
    pub fn id(&self) -> &SessionId {
        self.link.id()
    }

    /// The link handed to the handler for this handshake.
    pub fn link(&self) -> &SessionLink {
        &self.link
    }

    /// Registers the session if the handler established it and has not closed it.
    ///
    /// Any client metadata reported during the handshake is published right
    /// after registration.
    pub fn promote(self) -> Result<SessionLink, PendingSession> {
        if !self.link.is_established() || self.link.is_closed() {
            return Err(self);
        }
        let registry = &self.link.registry;
        registry.add(self.link.id.clone());
        if let Some(client) = self.link.client() {
            registry.update_client_info(&self.link.id, client);
        }
        debug!(session = %self.link.id, connection = %self.connection, "pending session promoted");
        Ok(self.link)
    }
}
