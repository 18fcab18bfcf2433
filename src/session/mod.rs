//! Logical sessions multiplexed over the gateway's connections.
//!
//! A session outlives any single socket: it is identified by an opaque token
//! the client echoes in a header, owned by the [`SessionRegistry`], and
//! evicted after a period of inactivity.

use std::borrow::Borrow;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod link;
pub mod registry;

pub use link::{PendingSession, SessionLink};
pub use registry::{SessionRegistry, Subscription};

/// Opaque session token carried in the session header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Mints a fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The token as sent in the session header.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Name and version the client reported about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl ClientInfo {
    /// Client name and version as reported during the handshake.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Snapshot of one registered session, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub connected_at: SystemTime,
    pub last_activity_at: SystemTime,
    pub client: Option<ClientInfo>,
}

/// Whether a session id is currently registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Absent,
    Active(SessionInfo),
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }
}

/// Why a session left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalReason {
    /// The inactivity window elapsed.
    Expired,
    /// The handler or an operator closed it explicitly.
    Closed,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Expired => "expired",
            Self::Closed => "closed",
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let ids: HashSet<_> = (0..64).map(|_| SessionId::generate()).collect();
        assert_eq!(ids.len(), 64);
    }

    #[test]
    fn session_id_serializes_as_plain_string() {
        let id = SessionId::from("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""abc""#);
    }
}
