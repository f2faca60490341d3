//! Health monitoring for agents.
//!
//! The `HealthMonitor` marks agents offline once their heartbeat is older
//! than the configured timeout. Offline agents receive no new work; their
//! in-flight attempts are left to finish or time out. A later heartbeat
//! reporting idle or busy brings the agent back.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agent::AgentId;
use crate::registry::AgentRegistry;

/// Periodic heartbeat check.
pub struct HealthMonitor {
    agents: Arc<AgentRegistry>,
    timeout: Duration,
}

impl HealthMonitor {
    pub fn new(agents: Arc<AgentRegistry>, timeout: Duration) -> Self {
        Self { agents, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// How often `run` sweeps.
    pub fn interval(&self) -> Duration {
        (self.timeout / 3).max(Duration::from_millis(10))
    }

    /// Mark stale agents offline. Returns the agents that changed.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<AgentId> {
        let stale = self.agents.mark_stale(self.timeout, now);
        if !stale.is_empty() {
            debug!(count = stale.len(), "health sweep marked agents offline");
        }
        stale
    }

    /// Sweep every `interval()` until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(timeout_secs = self.timeout.as_secs(), "health monitor started");
        let mut ticker = tokio::time::interval(self.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep(Utc::now());
                }
            }
        }
        debug!("health monitor stopped");
    }
}
