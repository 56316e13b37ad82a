use super::Hub;
use crate::transport::CloseStatus;
use futures::future::join_all;
use std::sync::atomic::Ordering;
use std::sync::Weak;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Outcome of one reaper sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapReport {
    pub stale_evicted: usize,
    pub expired_messages: usize,
}

impl Hub {
    /// Evict connections idle for longer than the stale threshold and expire
    /// old offline messages, both measured at `now`.
    ///
    /// Liveness does not matter here: a peer that answers every probe but
    /// sends nothing else is still reaped.
    pub async fn reap_stale(&self, now: std::time::Instant) -> ReapReport {
        let threshold = self.config.stale_threshold;
        let stale = self
            .registry
            .select(None, |c| c.idle_for(now) > threshold);

        for connection in &stale {
            info!(
                connection_id = %connection.id(),
                user_id = %connection.user_id(),
                idle_secs = connection.idle_for(now).as_secs(),
                "Reaping stale connection"
            );
        }
        join_all(stale.iter().map(|c| self.terminate(c, CloseStatus::Stale))).await;

        let expired = self.offline.sweep_expired(now);
        if expired > 0 {
            self.counters
                .messages_dropped
                .fetch_add(expired as u64, Ordering::Relaxed);
        }

        self.flush_presence().await;
        ReapReport {
            stale_evicted: stale.len(),
            expired_messages: expired,
        }
    }
}

pub(super) async fn run(hub: Weak<Hub>, period: Duration, token: CancellationToken) {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Stale reaper shutting down");
                break;
            }
            _ = interval.tick() => {
                let Some(hub) = hub.upgrade() else { break };
                let report = hub.reap_stale(std::time::Instant::now()).await;
                if report != ReapReport::default() {
                    debug!(
                        stale_evicted = report.stale_evicted,
                        expired_messages = report.expired_messages,
                        "Reaper sweep complete"
                    );
                }
            }
        }
    }
}
