//! Fan-out of outbound messages.
//!
//! Every recipient is served by its own send future, bounded by the
//! configured send timeout, and all of them are polled together. A failing
//! or slow recipient is evicted without holding up the others.

use super::registry::Connection;
use super::Hub;
use crate::error::Error;
use crate::transport::CloseStatus;
use crate::{ConnectionId, Envelope, OutboundMessage, Priority, Role, UserId};
use futures::future::join_all;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outcome of a targeted send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The transport accepted the envelope
    Sent,
    /// No such connection, or its transport failed and it was evicted
    Failed,
    /// The user is offline; the message waits in the offline queue
    Queued { message_id: Uuid, priority: Priority },
}

impl Delivery {
    pub fn is_sent(&self) -> bool {
        matches!(self, Delivery::Sent)
    }
}

/// Tally of a fan-out
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub sent: usize,
    pub failed: usize,
}

impl Hub {
    /// Send a message to one connection
    pub async fn send_to_connection(&self, id: &ConnectionId, message: &OutboundMessage) -> Delivery {
        let connection = match self.registry.get(id) {
            Some(connection) => connection,
            None => {
                debug!(connection_id = %id, kind = %message.kind, "Send to unknown connection");
                return Delivery::Failed;
            }
        };

        let delivered = self.deliver(&connection, &Envelope::wrap(message)).await;
        self.flush_presence().await;
        if delivered {
            Delivery::Sent
        } else {
            Delivery::Failed
        }
    }

    /// Send a message to a user's live connection, or queue it while the user is offline
    pub async fn send_to_user(&self, user_id: &UserId, message: &OutboundMessage) -> Delivery {
        if let Some(connection) = self.registry.get_by_user(user_id) {
            let delivered = self.deliver(&connection, &Envelope::wrap(message)).await;
            self.flush_presence().await;
            return if delivered {
                Delivery::Sent
            } else {
                Delivery::Failed
            };
        }

        if self.is_shutting_down() {
            return Delivery::Failed;
        }

        let enqueued = self.offline.enqueue(user_id, message.clone(), Instant::now());
        if let Some(displaced) = &enqueued.displaced {
            self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
            // Everything already queued outranks the new message
            if displaced.message_id == enqueued.message_id {
                return Delivery::Failed;
            }
        }
        self.counters.messages_queued.fetch_add(1, Ordering::Relaxed);
        Delivery::Queued {
            message_id: enqueued.message_id,
            priority: enqueued.priority,
        }
    }

    /// Deliver to every live connection except `exclude`
    pub async fn broadcast_all(
        &self,
        message: &OutboundMessage,
        exclude: Option<&ConnectionId>,
    ) -> BroadcastReport {
        let targets = self.registry.select(exclude, |_| true);
        self.broadcast(targets, message, "all").await
    }

    /// Deliver to every live connection with `role`
    pub async fn broadcast_to_role(
        &self,
        role: Role,
        message: &OutboundMessage,
        exclude: Option<&ConnectionId>,
    ) -> BroadcastReport {
        let targets = self.registry.select(exclude, |c| c.role() == role);
        self.broadcast(targets, message, role.as_str()).await
    }

    /// Deliver to every live connection subscribed to `topic`
    pub async fn broadcast_to_topic(
        &self,
        topic: &str,
        message: &OutboundMessage,
        exclude: Option<&ConnectionId>,
    ) -> BroadcastReport {
        let targets = self
            .subscribers(topic)
            .into_iter()
            .filter(|c| Some(&c.id()) != exclude)
            .collect();
        self.broadcast(targets, message, topic).await
    }

    async fn broadcast(
        &self,
        targets: Vec<Arc<Connection>>,
        message: &OutboundMessage,
        audience: &str,
    ) -> BroadcastReport {
        let report = self.fan_out(targets, message).await;
        debug!(
            audience,
            kind = %message.kind,
            sent = report.sent,
            failed = report.failed,
            "Broadcast complete"
        );
        self.flush_presence().await;
        report
    }

    /// Wrap `message` once and hand it to every target concurrently
    pub(super) async fn fan_out(
        &self,
        targets: Vec<Arc<Connection>>,
        message: &OutboundMessage,
    ) -> BroadcastReport {
        if targets.is_empty() {
            return BroadcastReport::default();
        }

        let envelope = Envelope::wrap(message);
        let results = join_all(targets.iter().map(|c| self.deliver(c, &envelope))).await;
        let sent = results.iter().filter(|delivered| **delivered).count();

        BroadcastReport {
            sent,
            failed: results.len() - sent,
        }
    }

    /// Send one envelope; a failure evicts and closes the connection
    pub(super) async fn deliver(&self, connection: &Arc<Connection>, envelope: &Envelope) -> bool {
        let result = match timeout(self.config.send_timeout, connection.transport().send(envelope))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        };

        match result {
            Ok(()) => {
                connection.touch();
                self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!(
                    connection_id = %connection.id(),
                    user_id = %connection.user_id(),
                    kind = %envelope.kind,
                    error = %e,
                    "Delivery failed, evicting connection"
                );
                self.counters.messages_failed.fetch_add(1, Ordering::Relaxed);
                self.terminate(connection, CloseStatus::SendFailed).await;
                false
            }
        }
    }
}
