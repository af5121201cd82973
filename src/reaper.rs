//! Idle-session reaper.
//!
//! Runs independently of message traffic: every `interval` it sweeps
//! sessions idle longer than `idle_timeout`, then escalates through the
//! governor if the process is under resource pressure.  Connection-close
//! removal races safely with the sweep; whichever runs first wins.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::governor::ResourceGovernor;
use crate::session::{SessionId, SessionRegistry};

pub struct IdleReaper {
    registry:     SessionRegistry,
    governor:     Arc<ResourceGovernor>,
    interval:     Duration,
    idle_timeout: Duration,
}

impl IdleReaper {
    pub fn new(
        registry:     SessionRegistry,
        governor:     Arc<ResourceGovernor>,
        interval:     Duration,
        idle_timeout: Duration,
    ) -> Self {
        IdleReaper { registry, governor, interval, idle_timeout }
    }

    /// One sweep pass.  Returns every id removed, normal and escalated.
    pub fn tick(&self) -> Vec<SessionId> {
        let mut removed = self.registry.sweep_idle(self.idle_timeout);
        if !removed.is_empty() {
            info!(
                "cleaned up {} stale session(s) (idle > {}s): {}",
                removed.len(),
                self.idle_timeout.as_secs(),
                join_ids(&removed)
            );
        }

        if self.governor.is_under_pressure() {
            warn!("under resource pressure: {}", self.governor.utilization_summary());
            removed.extend(self.governor.relieve_pressure());
        } else {
            debug!("{}", self.governor.utilization_summary());
        }
        removed
    }

    /// Run forever on the current runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.interval).await;
                self.tick();
            }
        })
    }
}

fn join_ids(ids: &[SessionId]) -> String {
    ids.iter().map(SessionId::as_str).collect::<Vec<_>>().join(", ")
}
