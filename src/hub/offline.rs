//! Offline delivery queue.
//!
//! Messages targeted at a user without a live connection are kept per user
//! id, ordered by descending priority and FIFO within a priority, and
//! replayed when the user is admitted again. Entries leave the queue when
//! delivered, when their delivery attempts are exhausted, or when they
//! outlive the expiry of their priority.

use crate::{HubConfig, OutboundMessage, UserId};
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Delivery priority of a queued message
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Classify a message type
    pub fn for_message_type(kind: &str) -> Self {
        match kind {
            "security_alert" | "emergency" | "system_alert" | "user_joined" | "user_left" => {
                Priority::Critical
            }
            "equipment_conflict" | "reservation_conflict" | "overdue_alert" => Priority::High,
            "notification" | "check_in" | "check_out" | "equipment_status" | "status_change" => {
                Priority::Medium
            }
            _ => Priority::Low,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A payload buffered for an offline user
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message_id: Uuid,
    pub user_id: UserId,
    pub message: OutboundMessage,
    pub enqueued_at: Instant,
    pub priority: Priority,
    pub delivery_attempts: u32,
    pub max_attempts: u32,
    seq: u64,
}

impl QueuedMessage {
    fn sort_key(&self) -> (Reverse<Priority>, u64) {
        (Reverse(self.priority), self.seq)
    }
}

/// Result of queueing one message
#[derive(Debug, Clone)]
pub(crate) struct Enqueued {
    pub message_id: Uuid,
    pub priority: Priority,
    /// Entry pushed out because the user's queue was full
    pub displaced: Option<QueuedMessage>,
}

/// Outcome of replaying a user's queue
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub requeued: usize,
    pub exhausted: usize,
}

#[derive(Debug, Clone)]
struct QueuePolicy {
    critical_expiry: Duration,
    default_expiry: Duration,
    critical_max_attempts: u32,
    default_max_attempts: u32,
    max_per_user: usize,
}

impl QueuePolicy {
    fn expiry(&self, priority: Priority) -> Duration {
        match priority {
            Priority::Critical => self.critical_expiry,
            _ => self.default_expiry,
        }
    }

    fn max_attempts(&self, priority: Priority) -> u32 {
        match priority {
            Priority::Critical => self.critical_max_attempts,
            _ => self.default_max_attempts,
        }
    }
}

pub(crate) struct OfflineQueue {
    queues: Mutex<HashMap<UserId, Vec<QueuedMessage>>>,
    policy: QueuePolicy,
    next_seq: AtomicU64,
}

impl OfflineQueue {
    pub fn new(config: &HubConfig) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            policy: QueuePolicy {
                critical_expiry: config.critical_expiry,
                default_expiry: config.default_expiry,
                critical_max_attempts: config.critical_max_attempts,
                default_max_attempts: config.default_max_attempts,
                max_per_user: config.max_queued_per_user,
            },
            next_seq: AtomicU64::new(0),
        }
    }

    /// Queue a message for an offline user
    pub fn enqueue(&self, user_id: &UserId, message: OutboundMessage, now: Instant) -> Enqueued {
        let priority = Priority::for_message_type(&message.kind);
        let queued = QueuedMessage {
            message_id: Uuid::new_v4(),
            user_id: user_id.clone(),
            message,
            enqueued_at: now,
            priority,
            delivery_attempts: 0,
            max_attempts: self.policy.max_attempts(priority),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let message_id = queued.message_id;

        let mut queues = self.queues.lock();
        let queue = queues.entry(user_id.clone()).or_default();
        insert_sorted(queue, queued);

        let displaced = if queue.len() > self.policy.max_per_user {
            queue.pop()
        } else {
            None
        };
        if let Some(dropped) = &displaced {
            warn!(
                user_id = %user_id,
                message_id = %dropped.message_id,
                priority = %dropped.priority,
                "Offline queue full, dropping message"
            );
        }

        debug!(
            user_id = %user_id,
            message_id = %message_id,
            priority = %priority,
            pending = queue.len(),
            "Queued message for offline user"
        );

        Enqueued {
            message_id,
            priority,
            displaced,
        }
    }

    /// Replay a user's queue through `deliver`, highest priority first.
    ///
    /// Stops at the first failed delivery; the failed entry is re-queued
    /// with one more attempt counted unless its attempts are exhausted, and
    /// the remaining entries stay queued untouched.
    pub async fn drain<F, Fut>(&self, user_id: &UserId, mut deliver: F) -> DrainReport
    where
        F: FnMut(QueuedMessage) -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut report = DrainReport::default();
        let pending = match self.queues.lock().remove(user_id) {
            Some(pending) => pending,
            None => return report,
        };

        let mut leftover = Vec::new();
        let mut pending = pending.into_iter();
        while let Some(mut queued) = pending.next() {
            queued.delivery_attempts += 1;
            if deliver(queued.clone()).await {
                report.delivered += 1;
                continue;
            }

            if queued.delivery_attempts >= queued.max_attempts {
                warn!(
                    user_id = %user_id,
                    message_id = %queued.message_id,
                    attempts = queued.delivery_attempts,
                    "Discarding offline message after exhausting delivery attempts"
                );
                report.exhausted += 1;
            } else {
                report.requeued += 1;
                leftover.push(queued);
            }
            leftover.extend(pending);
            break;
        }

        if !leftover.is_empty() {
            let mut queues = self.queues.lock();
            let queue = queues.entry(user_id.clone()).or_default();
            for queued in leftover {
                insert_sorted(queue, queued);
            }
        }

        if report.delivered > 0 {
            debug!(user_id = %user_id, delivered = report.delivered, "Replayed offline queue");
        }
        report
    }

    /// Remove entries older than their priority's expiry, returning how many were removed
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut removed = 0;
        let mut queues = self.queues.lock();
        queues.retain(|user_id, queue| {
            let before = queue.len();
            queue.retain(|queued| {
                now.saturating_duration_since(queued.enqueued_at)
                    <= self.policy.expiry(queued.priority)
            });
            let expired = before - queue.len();
            if expired > 0 {
                debug!(user_id = %user_id, expired, "Expired offline messages");
            }
            removed += expired;
            !queue.is_empty()
        });
        removed
    }

    /// Snapshot of a user's queue in delivery order
    pub fn pending(&self, user_id: &UserId) -> Vec<QueuedMessage> {
        self.queues
            .lock()
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_len(&self) -> usize {
        self.queues.lock().values().map(Vec::len).sum()
    }

    pub fn clear(&self) {
        self.queues.lock().clear();
    }
}

fn insert_sorted(queue: &mut Vec<QueuedMessage>, queued: QueuedMessage) {
    let key = queued.sort_key();
    let at = queue.partition_point(|existing| existing.sort_key() <= key);
    queue.insert(at, queued);
}
