//! The authoritative session map and its inactivity timers.
//!
//! # Concurrency
//!
//! The gateway runs on Tokio's multi-threaded runtime, so the map sits behind
//! a [`Mutex`]. The lock is never held across an `.await`, nor while a
//! subscriber or the removal callback runs; either may call straight back into
//! the registry. Removal deletes the entry before any side effect runs, which
//! makes a re-entrant `remove` of the same id a no-op.
//!
//! Each armed timer carries a generation number. Resetting a timer aborts the
//! old task and bumps the generation inside one critical section, so a timer
//! that already woke up cannot evict a session that was touched after it.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};

use tokio::task::AbortHandle;
use tracing::{debug, error, info};

use super::{ClientInfo, RemovalReason, SessionId, SessionInfo, SessionState};

type Listener = Arc<dyn Fn(&[SessionInfo]) + Send + Sync + 'static>;
type RemovalCallback = Arc<dyn Fn(&SessionId, RemovalReason) + Send + Sync + 'static>;

struct Entry {
    info: SessionInfo,
    generation: u64,
    timer: AbortHandle,
}

#[derive(Default)]
struct Sessions {
    entries: HashMap<SessionId, Entry>,
    next_generation: u64,
}

impl Sessions {
    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn snapshot(&self) -> Vec<SessionInfo> {
        let mut list: Vec<SessionInfo> = self.entries.values().map(|e| e.info.clone()).collect();
        list.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then_with(|| a.id.cmp(&b.id)));
        list
    }
}

struct Shared {
    timeout: Duration,
    sessions: Mutex<Sessions>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
    on_remove: Mutex<Option<RemovalCallback>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns every live session, its activity timestamps and its eviction timer.
///
/// Cloning is cheap; all clones share the same map. Construct one at startup
/// and call [`clear`](Self::clear) at shutdown.
///
/// Methods that arm timers (`add`, `update_activity`) spawn Tokio tasks and
/// must be called from within a Tokio runtime.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use sessiongate::session::{SessionId, SessionRegistry};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let registry = SessionRegistry::new(Duration::from_secs(60));
/// let id = SessionId::from("s1");
///
/// registry.add(id.clone());
/// assert!(registry.contains(&id));
///
/// assert!(registry.remove(&id));
/// assert!(!registry.remove(&id)); // already gone: no-op
/// # }
/// ```
#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<Shared>,
}

impl SessionRegistry {
    /// Creates an empty registry that evicts sessions idle for `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                timeout,
                sessions: Mutex::new(Sessions::default()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                on_remove: Mutex::new(None),
            }),
        }
    }

    /// The inactivity window after which a session is evicted.
    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    /// Registers `id`, or refreshes its activity if it is already registered.
    pub fn add(&self, id: SessionId) {
        let snapshot = {
            let mut sessions = lock(&self.shared.sessions);
            if self.refresh(&mut sessions, &id) {
                return;
            }
            let generation = sessions.bump();
            let timer = self.arm(id.clone(), generation);
            let now = SystemTime::now();
            let info = SessionInfo {
                id: id.clone(),
                connected_at: now,
                last_activity_at: now,
                client: None,
            };
            sessions.entries.insert(
                id.clone(),
                Entry {
                    info,
                    generation,
                    timer,
                },
            );
            sessions.snapshot()
        };

        info!(session = %id, "session registered");
        self.notify(&snapshot);
    }

    /// Removes `id`, returning `false` if it was not registered.
    ///
    /// The timer is cancelled and the entry deleted before subscribers and the
    /// removal callback run, so calling `remove` again from either is a no-op.
    pub fn remove(&self, id: &SessionId) -> bool {
        self.remove_with(id, RemovalReason::Closed)
    }

    /// Refreshes the activity timestamp of `id` and restarts its timer.
    ///
    /// Returns `false` if `id` is not registered.
    pub fn update_activity(&self, id: &SessionId) -> bool {
        let mut sessions = lock(&self.shared.sessions);
        self.refresh(&mut sessions, id)
    }

    /// Attaches client-reported metadata to `id` without touching its timer.
    ///
    /// Returns `false` if `id` is not registered.
    pub fn update_client_info(&self, id: &SessionId, client: ClientInfo) -> bool {
        let snapshot = {
            let mut sessions = lock(&self.shared.sessions);
            let Some(entry) = sessions.entries.get_mut(id) else {
                return false;
            };
            debug!(session = %id, client = %client.name, version = %client.version, "client info updated");
            entry.info.client = Some(client);
            sessions.snapshot()
        };
        self.notify(&snapshot);
        true
    }

    /// Calls `listener` with the current sessions now and after every change.
    ///
    /// A panicking listener is logged and skipped; it does not stop other
    /// listeners from being notified.
    #[must_use = "keep the Subscription to be able to unsubscribe"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&[SessionInfo]) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        let snapshot = {
            let sessions = lock(&self.shared.sessions);
            lock(&self.shared.listeners).push((id, Arc::clone(&listener)));
            sessions.snapshot()
        };
        deliver(&listener, &snapshot);
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Installs the hook run after a session is removed or expires.
    ///
    /// Replaces any previous callback.
    pub fn set_removal_callback<F>(&self, callback: F)
    where
        F: Fn(&SessionId, RemovalReason) + Send + Sync + 'static,
    {
        *lock(&self.shared.on_remove) = Some(Arc::new(callback));
    }

    /// Cancels every timer and empties the map.
    ///
    /// No removal callbacks fire; subscribers receive one empty snapshot.
    pub fn clear(&self) {
        let drained: Vec<Entry> = {
            let mut sessions = lock(&self.shared.sessions);
            sessions.entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &drained {
            entry.timer.abort();
        }
        info!(count = drained.len(), "session registry cleared");
        self.notify(&[]);
    }

    /// Returns whether `id` is registered, with its record if so.
    pub fn state(&self, id: &SessionId) -> SessionState {
        match lock(&self.shared.sessions).entries.get(id) {
            Some(entry) => SessionState::Active(entry.info.clone()),
            None => SessionState::Absent,
        }
    }

    /// Whether `id` is currently registered.
    pub fn contains(&self, id: &SessionId) -> bool {
        lock(&self.shared.sessions).entries.contains_key(id)
    }

    /// All registered sessions, oldest first.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        lock(&self.shared.sessions).snapshot()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        lock(&self.shared.sessions).entries.len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_with(&self, id: &SessionId, reason: RemovalReason) -> bool {
        let snapshot = {
            let mut sessions = lock(&self.shared.sessions);
            let Some(entry) = sessions.entries.remove(id) else {
                return false;
            };
            entry.timer.abort();
            sessions.snapshot()
        };
        self.finish_removal(id, reason, &snapshot);
        true
    }

    fn expire(&self, id: &SessionId, generation: u64) {
        let snapshot = {
            let mut sessions = lock(&self.shared.sessions);
            match sessions.entries.get(id) {
                Some(entry) if entry.generation == generation => {}
                _ => return,
            }
            sessions.entries.remove(id);
            sessions.snapshot()
        };
        self.finish_removal(id, RemovalReason::Expired, &snapshot);
    }

    fn finish_removal(&self, id: &SessionId, reason: RemovalReason, snapshot: &[SessionInfo]) {
        info!(session = %id, %reason, "session removed");
        self.notify(snapshot);

        let callback = lock(&self.shared.on_remove).clone();
        if let Some(callback) = callback {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(id, reason)));
            if outcome.is_err() {
                error!(session = %id, "session removal callback panicked");
            }
        }
    }

    fn refresh(&self, sessions: &mut Sessions, id: &SessionId) -> bool {
        let generation = sessions.bump();
        let Some(entry) = sessions.entries.get_mut(id) else {
            return false;
        };
        entry.timer.abort();
        entry.generation = generation;
        entry.timer = self.arm(id.clone(), generation);
        entry.info.last_activity_at = SystemTime::now();
        true
    }

    fn arm(&self, id: SessionId, generation: u64) -> AbortHandle {
        let shared = Arc::downgrade(&self.shared);
        let timeout = self.shared.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = shared.upgrade() {
                SessionRegistry { shared }.expire(&id, generation);
            }
        })
        .abort_handle()
    }

    fn notify(&self, snapshot: &[SessionInfo]) {
        let listeners: Vec<Listener> = lock(&self.shared.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in &listeners {
            deliver(listener, snapshot);
        }
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("timeout", &self.shared.timeout)
            .field("sessions", &self.len())
            .finish()
    }
}

fn deliver(listener: &Listener, snapshot: &[SessionInfo]) {
    if panic::catch_unwind(AssertUnwindSafe(|| listener(snapshot))).is_err() {
        error!("session listener panicked");
    }
}

/// Handle returned by [`SessionRegistry::subscribe`].
///
/// Dropping it leaves the listener registered; call
/// [`unsubscribe`](Self::unsubscribe) to stop notifications.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Stops further notifications to this listener.
    pub fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade() {
            lock(&shared.listeners).retain(|(id, _)| *id != self.id);
        }
    }
}
