//! Session registry: the only place sessions are created, looked up and
//! removed.
//!
//! Backed by a sharded [`DashMap`], so operations on unrelated sessions never
//! contend on a single lock.  Removal (by connection close or idle sweep)
//! always terminates the state before handing it back; racing removals
//! resolve to one winner and the loser sees `None`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::debug;

use super::{SessionId, SessionState};

/// Concurrent keyed store of live sessions.  Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, Arc<SessionState>>>,
}

impl SessionRegistry {
    pub fn new() -> Self { Self::default() }

    /// Create the session for `id`, or return the live one if it already
    /// exists.
    pub fn create(&self, id: SessionId) -> Arc<SessionState> {
        let entry = self
            .sessions
            .entry(id.clone())
            .or_insert_with(|| Arc::new(SessionState::new(id)));
        Arc::clone(entry.value())
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionState>> {
        self.sessions.get(id).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Detach and terminate the session.  Idempotent: a second call returns
    /// `None`.
    pub fn remove(&self, id: &str) -> Option<Arc<SessionState>> {
        let (_, state) = self.sessions.remove(id)?;
        Some(detach(state))
    }

    /// Snapshot of live session ids (weakly consistent).
    pub fn list_active(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn count(&self) -> usize { self.sessions.len() }

    /// Remove every session idle for longer than `threshold`.
    pub fn sweep_idle(&self, threshold: Duration) -> Vec<SessionId> {
        self.sweep_idle_at(threshold, Instant::now())
    }

    pub fn sweep_idle_at(&self, threshold: Duration, now: Instant) -> Vec<SessionId> {
        // Collect first: removing while iterating would deadlock on the shard.
        let candidates: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| e.value().idle_for(now) > threshold)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(candidates.len());
        for id in candidates {
            // Re-check under the shard lock: activity may have arrived since.
            let taken = self
                .sessions
                .remove_if(id.as_str(), |_, s| s.idle_for(now) > threshold);
            if let Some((id, state)) = taken {
                detach(state);
                removed.push(id);
            }
        }
        if !removed.is_empty() {
            debug!("idle sweep (>{}s) removed {} session(s)", threshold.as_secs(), removed.len());
        }
        removed
    }
}

fn detach(state: Arc<SessionState>) -> Arc<SessionState> {
    state.terminate();
    state
}
