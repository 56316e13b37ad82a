//! Heartbeat monitor.
//!
//! Each cycle a connection whose `alive` flag is still cleared from the
//! previous cycle is closed and evicted. Every other connection has its flag
//! cleared and receives a probe; the peer's pong sets the flag again before
//! the next cycle.

use super::Hub;
use crate::error::Error;
use crate::transport::CloseStatus;
use futures::future::join_all;
use std::sync::Weak;
use std::time::Duration;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of one heartbeat cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub probed: usize,
    pub unresponsive: usize,
    pub probe_failures: usize,
}

impl Hub {
    /// Run one heartbeat cycle
    pub async fn heartbeat_tick(&self) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();
        let (to_probe, unresponsive): (Vec<_>, Vec<_>) = self
            .registry
            .all()
            .into_iter()
            .partition(|c| c.take_alive());

        for connection in &unresponsive {
            warn!(
                connection_id = %connection.id(),
                user_id = %connection.user_id(),
                "No pong since last heartbeat, closing connection"
            );
        }
        report.unresponsive = unresponsive.len();
        join_all(
            unresponsive
                .iter()
                .map(|c| self.terminate(c, CloseStatus::Unresponsive)),
        )
        .await;

        let probes = join_all(to_probe.iter().map(|c| async move {
            let result = match timeout(self.config.send_timeout, c.transport().probe()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            };
            (c, result)
        }))
        .await;

        for (connection, result) in probes {
            match result {
                Ok(()) => report.probed += 1,
                Err(e) => {
                    warn!(
                        connection_id = %connection.id(),
                        error = %e,
                        "Heartbeat probe failed, evicting connection"
                    );
                    report.probe_failures += 1;
                    self.terminate(connection, CloseStatus::Unresponsive).await;
                }
            }
        }

        self.flush_presence().await;
        report
    }
}

pub(super) async fn run(hub: Weak<Hub>, period: Duration, token: CancellationToken) {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Heartbeat monitor shutting down");
                break;
            }
            _ = interval.tick() => {
                let Some(hub) = hub.upgrade() else { break };
                let report = hub.heartbeat_tick().await;
                if report.unresponsive > 0 || report.probe_failures > 0 {
                    debug!(
                        probed = report.probed,
                        unresponsive = report.unresponsive,
                        probe_failures = report.probe_failures,
                        "Heartbeat cycle evicted connections"
                    );
                }
            }
        }
    }
}
