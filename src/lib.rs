//! A real-time connection and broadcast core for multi-user dashboards.
//!
//! This library owns the set of live client connections of a dashboard
//! server and fans state changes out to them by role, by topic or to a single
//! user. Users that are offline have their targeted messages queued and
//! replayed on reconnect, and dead or idle connections are evicted by a
//! heartbeat monitor and a stale-connection reaper.
//!
//! Transports are pluggable through the [`Transport`] trait; the hub never
//! inspects message payloads.

pub mod error;
pub mod hub;
pub mod transport;
mod topic;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

pub use error::{Error, Result};
pub use hub::{
    Admission, BroadcastReport, Connection, Delivery, DrainReport, HeartbeatReport, Hub,
    InboundEvent, Priority, QueuedMessage, ReapReport,
};
pub use topic::{Topic, MAX_TOPIC_LENGTH};
pub use transport::{ChannelTransport, CloseStatus, Frame, Transport};

/// Configuration for creating a new hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Interval between two heartbeat probe cycles
    pub heartbeat_interval: Duration,
    /// Interval between two stale-connection sweeps
    pub reaper_interval: Duration,
    /// Idle time after which a connection is considered stale
    pub stale_threshold: Duration,
    /// Upper bound for a single transport send, probe or close
    pub send_timeout: Duration,
    /// Maximum number of live connections
    pub max_connections: usize,
    /// Maximum topic subscriptions per connection
    pub max_subscriptions_per_connection: usize,
    /// Maximum number of offline messages retained per user
    pub max_queued_per_user: usize,
    /// Expiry of queued critical messages
    pub critical_expiry: Duration,
    /// Expiry of every other queued message
    pub default_expiry: Duration,
    /// Delivery attempts for queued critical messages
    pub critical_max_attempts: u32,
    /// Delivery attempts for every other queued message
    pub default_max_attempts: u32,
    /// Roles that receive presence (joined/left) events
    pub presence_roles: Vec<Role>,
    /// Capacity of the channel behind a [`ChannelTransport`]
    pub transport_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(5 * 60),
            send_timeout: Duration::from_secs(5),
            max_connections: 10_000,
            max_subscriptions_per_connection: 100,
            max_queued_per_user: 100,
            critical_expiry: Duration::from_secs(24 * 60 * 60),
            default_expiry: Duration::from_secs(60 * 60),
            critical_max_attempts: 5,
            default_max_attempts: 3,
            presence_roles: vec![Role::Admin, Role::Staff],
            transport_buffer: 256,
        }
    }
}

impl HubConfig {
    /// Check the configuration for values the hub cannot run with
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("reaper_interval", self.reaper_interval),
            ("stale_threshold", self.stale_threshold),
            ("send_timeout", self.send_timeout),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(Error::InvalidConfig(format!("{} cannot be zero", name)));
            }
        }
        if self.max_connections == 0 {
            return Err(Error::InvalidConfig("max_connections cannot be zero".into()));
        }
        if self.max_queued_per_user == 0 {
            return Err(Error::InvalidConfig(
                "max_queued_per_user cannot be zero".into(),
            ));
        }
        if self.critical_max_attempts == 0 || self.default_max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max delivery attempts cannot be zero".into(),
            ));
        }
        if self.transport_buffer == 0 {
            return Err(Error::InvalidConfig("transport_buffer cannot be zero".into()));
        }
        Ok(())
    }
}

/// Unique identifier for a connection
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the string representation of the connection ID
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of an authenticated principal
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authorization role carried from the authentication layer
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Staff,
    Student,
    Guest,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Staff => "staff",
            Role::Student => "student",
            Role::Guest => "guest",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message handed to the hub by an application collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Application-defined message type, e.g. `check_in`
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque payload
    #[serde(default)]
    pub data: serde_json::Value,
}

impl OutboundMessage {
    /// Create a new message
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Create a message without payload
    pub fn empty(kind: impl Into<String>) -> Self {
        Self::new(kind, serde_json::Value::Null)
    }
}

/// The wrapper applied to every message leaving the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

impl Envelope {
    /// Wrap a message with a fresh id and the current time
    pub fn wrap(message: &OutboundMessage) -> Self {
        Self::with_id(Uuid::new_v4(), message)
    }

    /// Wrap a message keeping an id assigned earlier, e.g. when replaying a queued message
    pub fn with_id(id: Uuid, message: &OutboundMessage) -> Self {
        Self {
            id,
            timestamp: Utc::now(),
            kind: message.kind.clone(),
            data: message.data.clone(),
        }
    }

    /// Serialize the envelope to its JSON wire form
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Statistics about the hub's operation
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    /// Number of currently live connections
    pub total_connections: usize,
    /// Live connections per role
    pub connections_by_role: HashMap<Role, usize>,
    /// Mean age of the live connections
    pub average_connection_age: Duration,
    /// Total number of topic subscriptions across connections
    pub total_subscriptions: usize,
    /// Number of topics with at least one subscriber
    pub active_topics: usize,
    /// Messages waiting in offline queues
    pub queued_messages: usize,
    /// Envelopes handed successfully to transports
    pub messages_sent: u64,
    /// Envelopes whose transport send failed
    pub messages_failed: u64,
    /// Messages queued for offline users
    pub messages_queued: u64,
    /// Queued messages discarded after exhaustion, expiry or overflow
    pub messages_dropped: u64,
    /// Connections evicted since start
    pub connections_evicted: u64,
}
