mod broadcast;
mod heartbeat;
mod offline;
mod reaper;
mod registry;
mod subscriptions;

use crate::error::{Error, Result};
use crate::transport::{ChannelTransport, CloseStatus, Frame, Transport};
use crate::{ConnectionId, Envelope, HubConfig, HubStats, OutboundMessage, Role, Topic, UserId};
use futures::future::join_all;
use offline::OfflineQueue;
use parking_lot::Mutex;
use registry::Registry;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use subscriptions::SubscriptionIndex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use broadcast::{BroadcastReport, Delivery};
pub use heartbeat::HeartbeatReport;
pub use offline::{DrainReport, Priority, QueuedMessage};
pub use reaper::ReapReport;
pub use registry::Connection;

/// An authenticated session handed to the hub by the accept layer
pub struct Admission {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
    pub transport: Arc<dyn Transport>,
}

impl Admission {
    /// Describe a new session, generating its connection id
    pub fn new(
        user_id: impl Into<UserId>,
        display_name: impl Into<String>,
        role: Role,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            connection_id: ConnectionId::new(),
            user_id: user_id.into(),
            display_name: display_name.into(),
            role,
            transport,
        }
    }
}

/// Control messages received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Subscribe(String),
    Unsubscribe(String),
    /// Application-level keepalive from the peer; answered with `pong`
    Ping,
    /// Answer to a heartbeat probe
    Pong,
    /// Any other application traffic
    Activity,
}

/// Statistics counters for the hub
#[derive(Default)]
struct Counters {
    messages_sent: AtomicU64,
    messages_failed: AtomicU64,
    messages_queued: AtomicU64,
    messages_dropped: AtomicU64,
    connections_evicted: AtomicU64,
}

/// A presence broadcast waiting to be flushed
struct PresenceEvent {
    message: OutboundMessage,
    exclude: ConnectionId,
}

/// The connection and broadcast service.
///
/// Owns the registry, the subscription index and the offline queue. Share
/// it as `Arc<Hub>`; call [`Hub::start`] to run the heartbeat monitor and
/// the stale reaper, and [`Hub::shutdown`] once to stop everything.
pub struct Hub {
    config: HubConfig,
    registry: Registry,
    subscriptions: SubscriptionIndex,
    offline: OfflineQueue,
    counters: Counters,
    presence: Mutex<VecDeque<PresenceEvent>>,
    shutdown_token: CancellationToken,
    shutdown_complete: CancellationToken,
    is_shutting_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Create a new hub instance
    pub fn new(config: HubConfig) -> Result<Self> {
        config.validate()?;
        info!(
            heartbeat_secs = config.heartbeat_interval.as_secs(),
            stale_secs = config.stale_threshold.as_secs(),
            max_connections = config.max_connections,
            "Creating new hub"
        );

        Ok(Self {
            offline: OfflineQueue::new(&config),
            registry: Registry::new(),
            subscriptions: SubscriptionIndex::new(),
            counters: Counters::default(),
            presence: Mutex::new(VecDeque::new()),
            shutdown_token: CancellationToken::new(),
            shutdown_complete: CancellationToken::new(),
            is_shutting_down: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Create a channel transport sized by `transport_buffer`
    pub fn channel_transport(&self) -> (ChannelTransport, mpsc::Receiver<Frame>) {
        ChannelTransport::new(self.config.transport_buffer)
    }

    /// Spawn the heartbeat monitor and the stale reaper on the current runtime
    pub fn start(self: &Arc<Self>) {
        if self.is_shutting_down() {
            warn!("Refusing to start background tasks on a hub that is shutting down");
            return;
        }

        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            debug!("Background tasks already running");
            return;
        }
        tasks.push(tokio::spawn(heartbeat::run(
            Arc::downgrade(self),
            self.config.heartbeat_interval,
            self.shutdown_token.clone(),
        )));
        tasks.push(tokio::spawn(reaper::run(
            Arc::downgrade(self),
            self.config.reaper_interval,
            self.shutdown_token.clone(),
        )));
        info!("Hub background tasks started");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::Acquire)
    }

    // ==================== Connection Lifecycle ====================

    /// Admit an authenticated session.
    ///
    /// A previous connection of the same user is evicted and closed with
    /// [`CloseStatus::Superseded`]. Messages queued while the user was
    /// offline are replayed before this returns, and a `user_joined` event
    /// is sent to the presence roles.
    pub async fn admit(&self, admission: Admission) -> Result<Arc<Connection>> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }

        let Admission {
            connection_id,
            user_id,
            display_name,
            role,
            transport,
        } = admission;
        let connection = Arc::new(Connection::new(
            connection_id,
            user_id,
            display_name,
            role,
            transport,
        ));

        let replaced = self
            .registry
            .insert(Arc::clone(&connection), self.config.max_connections)?;

        if let Some(previous) = replaced {
            self.subscriptions.remove_connection(&previous);
            self.counters
                .connections_evicted
                .fetch_add(1, Ordering::Relaxed);
            info!(
                connection_id = %previous.id(),
                user_id = %previous.user_id(),
                "Connection superseded by re-admission"
            );
            self.close_transport(&previous, CloseStatus::Superseded).await;
        }

        // Shutdown may have drained the registry between the check above and the insert.
        if self.is_shutting_down() {
            self.registry.remove(&connection.id());
            self.close_transport(&connection, CloseStatus::ServerShutdown)
                .await;
            return Err(Error::ShuttingDown);
        }

        info!(
            connection_id = %connection.id(),
            user_id = %connection.user_id(),
            role = %connection.role(),
            "Connection admitted"
        );

        self.replay_offline(connection.user_id()).await;

        // A failed replay has already evicted the connection.
        if !connection.is_closed() {
            self.schedule_presence("user_joined", &connection);
        }
        self.flush_presence().await;

        Ok(connection)
    }

    /// Replay a user's offline queue to their live connection.
    ///
    /// A failed replay evicts the connection it was aimed at. If the user has
    /// been re-admitted in the meantime, the remainder goes to the newer
    /// connection instead of waiting for the next admission.
    async fn replay_offline(&self, user_id: &UserId) {
        while let Some(connection) = self.registry.get_by_user(user_id) {
            let target = &connection;
            let report = self
                .offline
                .drain(user_id, move |queued| {
                    let connection = target;
                    async move {
                        let envelope = Envelope::with_id(queued.message_id, &queued.message);
                        self.deliver(connection, &envelope).await
                    }
                })
                .await;
            if report.exhausted > 0 {
                self.counters
                    .messages_dropped
                    .fetch_add(report.exhausted as u64, Ordering::Relaxed);
            }
            if report.requeued == 0 && report.exhausted == 0 {
                break;
            }

            match self.registry.get_by_user(user_id) {
                Some(next) if next.id() != connection.id() => {
                    debug!(
                        user_id = %user_id,
                        connection_id = %next.id(),
                        pending = report.requeued,
                        "Connection replaced during replay, resuming on the new one"
                    );
                }
                _ => break,
            }
        }
    }

    /// Remove a connection and schedule a `user_left` event.
    ///
    /// Idempotent; returns false for unknown ids. The transport is not
    /// closed, see [`Hub::disconnect`] for the peer-initiated path.
    pub(crate) fn evict(&self, id: &ConnectionId) -> bool {
        let connection = match self.registry.remove(id) {
            Some(connection) => connection,
            None => return false,
        };
        self.subscriptions.remove_connection(&connection);
        self.counters
            .connections_evicted
            .fetch_add(1, Ordering::Relaxed);

        info!(
            connection_id = %connection.id(),
            user_id = %connection.user_id(),
            "Connection evicted"
        );
        self.schedule_presence("user_left", &connection);
        true
    }

    /// Notification from the transport layer that a peer went away
    pub async fn disconnect(&self, id: &ConnectionId) -> bool {
        let evicted = self.evict(id);
        self.flush_presence().await;
        evicted
    }

    /// Evict a connection and close its transport with `status`
    pub(crate) async fn terminate(&self, connection: &Arc<Connection>, status: CloseStatus) {
        if self.evict(&connection.id()) {
            self.close_transport(connection, status).await;
        }
    }

    async fn close_transport(&self, connection: &Connection, status: CloseStatus) {
        let result = match timeout(self.config.send_timeout, connection.transport().close(status))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        };
        if let Err(e) = result {
            warn!(
                connection_id = %connection.id(),
                code = status.code(),
                error = %e,
                "Failed to close transport"
            );
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.registry.get(id)
    }

    pub fn get_by_user(&self, user_id: &UserId) -> Option<Arc<Connection>> {
        self.registry.get_by_user(user_id)
    }

    /// Record traffic on a connection and mark it alive
    pub fn touch(&self, id: &ConnectionId) -> bool {
        match self.registry.get(id) {
            Some(connection) => {
                connection.touch();
                true
            }
            None => false,
        }
    }

    /// Mark a connection alive without counting it as traffic
    pub fn confirm_alive(&self, id: &ConnectionId) -> bool {
        match self.registry.get(id) {
            Some(connection) => {
                connection.confirm_alive();
                true
            }
            None => false,
        }
    }

    /// Apply a control message received from a peer. Unknown connections are ignored.
    pub async fn handle_inbound(&self, id: &ConnectionId, event: InboundEvent) -> Result<()> {
        let connection = match self.registry.get(id) {
            Some(connection) => connection,
            None => {
                debug!(connection_id = %id, ?event, "Inbound event for unknown connection");
                return Ok(());
            }
        };

        match event {
            InboundEvent::Subscribe(topic) => {
                connection.touch();
                self.subscribe(id, &topic)?;
            }
            InboundEvent::Unsubscribe(topic) => {
                connection.touch();
                self.unsubscribe(id, &topic);
            }
            InboundEvent::Ping => {
                connection.confirm_alive();
                let pong = Envelope::wrap(&OutboundMessage::empty("pong"));
                let sent = match timeout(self.config.send_timeout, connection.transport().send(&pong))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout),
                };
                if let Err(e) = sent {
                    warn!(connection_id = %id, error = %e, "Failed to answer ping");
                    self.terminate(&connection, CloseStatus::SendFailed).await;
                    self.flush_presence().await;
                }
            }
            InboundEvent::Pong => {
                connection.confirm_alive();
            }
            InboundEvent::Activity => {
                connection.touch();
            }
        }
        Ok(())
    }

    // ==================== Subscriptions ====================

    /// Subscribe a connection to a topic; unknown connections are a no-op
    pub fn subscribe(&self, id: &ConnectionId, topic: &str) -> Result<bool> {
        let topic = Topic::new(topic)?;
        match self.registry.get(id) {
            Some(connection) => self.subscriptions.subscribe(
                &connection,
                topic,
                self.config.max_subscriptions_per_connection,
            ),
            None => Ok(false),
        }
    }

    pub fn unsubscribe(&self, id: &ConnectionId, topic: &str) -> bool {
        match self.registry.get(id) {
            Some(connection) => self.subscriptions.unsubscribe(&connection, topic.trim()),
            None => false,
        }
    }

    /// Live connections subscribed to `topic`
    pub fn subscribers(&self, topic: &str) -> Vec<Arc<Connection>> {
        self.subscriptions
            .subscriber_ids(topic.trim())
            .iter()
            .filter_map(|id| self.registry.get(id))
            .collect()
    }

    // ==================== Offline Queue ====================

    /// Messages waiting for an offline user, in delivery order
    pub fn pending_for(&self, user_id: &UserId) -> Vec<QueuedMessage> {
        self.offline.pending(user_id)
    }

    // ==================== Presence ====================

    fn schedule_presence(&self, kind: &str, connection: &Connection) {
        if self.is_shutting_down() {
            return;
        }
        let message = OutboundMessage::new(
            kind,
            json!({
                "connectionId": connection.id().as_str(),
                "userId": connection.user_id().as_str(),
                "displayName": connection.display_name(),
                "role": connection.role(),
            }),
        );
        self.presence.lock().push_back(PresenceEvent {
            message,
            exclude: connection.id(),
        });
    }

    /// Deliver scheduled presence events. Evictions caused by these
    /// deliveries schedule further events, which are flushed in the same loop.
    pub(crate) async fn flush_presence(&self) {
        loop {
            let event = match self.presence.lock().pop_front() {
                Some(event) => event,
                None => break,
            };
            let roles = &self.config.presence_roles;
            let targets = self
                .registry
                .select(Some(&event.exclude), |c| roles.contains(&c.role()));
            let report = self.fan_out(targets, &event.message).await;
            debug!(
                kind = %event.message.kind,
                sent = report.sent,
                failed = report.failed,
                "Presence event delivered"
            );
        }
    }

    // ==================== Observability ====================

    /// Get hub statistics
    pub fn snapshot(&self) -> HubStats {
        let connections = self.registry.all();
        let now = Instant::now();

        let mut connections_by_role: HashMap<Role, usize> = HashMap::new();
        let mut total_age = Duration::ZERO;
        let mut total_subscriptions = 0;
        for connection in &connections {
            *connections_by_role.entry(connection.role()).or_default() += 1;
            total_age += now.saturating_duration_since(connection.connected_at());
            total_subscriptions += connection.subscription_count();
        }
        let average_connection_age = if connections.is_empty() {
            Duration::ZERO
        } else {
            total_age / connections.len() as u32
        };

        HubStats {
            total_connections: connections.len(),
            connections_by_role,
            average_connection_age,
            total_subscriptions,
            active_topics: self.subscriptions.topic_count(),
            queued_messages: self.offline.total_len(),
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            messages_failed: self.counters.messages_failed.load(Ordering::Relaxed),
            messages_queued: self.counters.messages_queued.load(Ordering::Relaxed),
            messages_dropped: self.counters.messages_dropped.load(Ordering::Relaxed),
            connections_evicted: self.counters.connections_evicted.load(Ordering::Relaxed),
        }
    }

    // ==================== Shutdown ====================

    /// Stop background tasks, close every transport and clear all state.
    ///
    /// Only the first call does any work; concurrent and later calls wait
    /// until it has finished.
    pub async fn shutdown(&self) {
        if self.is_shutting_down.swap(true, Ordering::AcqRel) {
            debug!("Hub shutdown already in progress");
            self.shutdown_complete.cancelled().await;
            return;
        }
        // Releases waiting callers even if this future is dropped midway.
        let _complete = self.shutdown_complete.clone().drop_guard();
        info!(
            connections = self.registry.len(),
            "Initiating hub shutdown"
        );

        self.shutdown_token.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        let connections = self.registry.take_all();
        self.subscriptions.clear();
        self.offline.clear();
        self.presence.lock().clear();

        join_all(
            connections
                .iter()
                .map(|c| self.close_transport(c, CloseStatus::ServerShutdown)),
        )
        .await;

        info!(closed = connections.len(), "Hub shutdown complete");
    }
}
