use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::{ConnectionId, Role, Topic, UserId};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// One accepted, live transport session
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    display_name: String,
    role: Role,
    transport: Arc<dyn Transport>,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
    alive: AtomicBool,
    closed: AtomicBool,
    pub(super) subscriptions: Mutex<HashSet<Topic>>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        user_id: UserId,
        display_name: String,
        role: Role,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            user_id,
            display_name,
            role,
            transport,
            connected_at: now,
            last_activity: Mutex::new(now),
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            subscriptions: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Time since the last inbound or outbound traffic, measured at `now`
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Topics this connection is subscribed to
    pub fn subscriptions(&self) -> Vec<Topic> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// True once the connection has been removed from the registry
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
        self.alive.store(true, Ordering::Release);
    }

    pub(crate) fn confirm_alive(&self) {
        self.alive.store(true, Ordering::Release);
    }

    /// Clear the liveness flag, returning its previous value
    pub(crate) fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, at: Instant) {
        *self.last_activity.lock() = at;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .field("alive", &self.is_alive())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    by_user: HashMap<UserId, ConnectionId>,
}

/// Owns every live connection and the user index.
///
/// Both maps are updated under one write lock so a connection is never
/// visible in one index and missing from the other.
#[derive(Default)]
pub(crate) struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection, returning the one it replaces in the user index
    pub fn insert(
        &self,
        connection: Arc<Connection>,
        max_connections: usize,
    ) -> Result<Option<Arc<Connection>>> {
        let mut state = self.state.write();

        if state.connections.contains_key(&connection.id) {
            return Err(Error::DuplicateConnection(connection.id.as_str()));
        }

        let replaced = state
            .by_user
            .get(&connection.user_id)
            .copied()
            .and_then(|id| state.connections.remove(&id));

        if replaced.is_none() && state.connections.len() >= max_connections {
            return Err(Error::ConnectionLimitExceeded);
        }

        if let Some(previous) = &replaced {
            previous.closed.store(true, Ordering::Release);
        }
        state
            .by_user
            .insert(connection.user_id.clone(), connection.id);
        state
            .connections
            .insert(connection.id, Arc::clone(&connection));

        debug!(
            connection_id = %connection.id,
            user_id = %connection.user_id,
            role = %connection.role,
            live = state.connections.len(),
            "Connection registered"
        );

        Ok(replaced)
    }

    /// Remove a connection; unknown ids are ignored
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let mut state = self.state.write();
        let connection = state.connections.remove(id)?;
        connection.closed.store(true, Ordering::Release);

        if state.by_user.get(&connection.user_id) == Some(id) {
            state.by_user.remove(&connection.user_id);
        }
        Some(connection)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.state.read().connections.get(id).cloned()
    }

    pub fn get_by_user(&self, user_id: &UserId) -> Option<Arc<Connection>> {
        let state = self.state.read();
        state
            .by_user
            .get(user_id)
            .and_then(|id| state.connections.get(id))
            .cloned()
    }

    /// Live connections matching `filter`, skipping `exclude`
    pub fn select<F>(&self, exclude: Option<&ConnectionId>, filter: F) -> Vec<Arc<Connection>>
    where
        F: Fn(&Connection) -> bool,
    {
        self.state
            .read()
            .connections
            .values()
            .filter(|c| Some(&c.id) != exclude && filter(c))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.select(None, |_| true)
    }

    pub fn len(&self) -> usize {
        self.state.read().connections.len()
    }

    /// Remove every connection at once
    pub fn take_all(&self) -> Vec<Arc<Connection>> {
        let mut state = self.state.write();
        state.by_user.clear();
        let drained: Vec<_> = state.connections.drain().map(|(_, c)| c).collect();
        for connection in &drained {
            connection.closed.store(true, Ordering::Release);
        }
        drained
    }
}
