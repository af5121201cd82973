//! Session state: bounded sample window, cooldown timers and the
//! generation in-flight flag for a single connection.
//!
//! The buffer and timers sit behind one short-lived mutex; the in-flight flag
//! is a separate atomic so the generation guard never waits on the buffer
//! lock.  Every time-dependent operation has an `_at(now)` form so callers
//! (and tests) can supply the clock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{SessionError, SessionId, BUFFER_CAPACITY, COOLDOWN, TRIGGER_THRESHOLD};

/// Observable lifecycle position of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Buffering, no generation outstanding.
    Active,
    /// A generation call is outstanding.
    Generating,
    /// Detached from the registry; terminal.
    Removed,
}

#[derive(Debug)]
struct Window {
    samples: VecDeque<f32>,
    last_generation_at: Option<Instant>,
    last_activity_at: Instant,
    removed: bool,
}

/// Per-connection session state.
#[derive(Debug)]
pub struct SessionState {
    id: SessionId,
    window: Mutex<Window>,
    generation_in_flight: AtomicBool,
}

impl SessionState {
    pub fn new(id: SessionId) -> Self {
        Self::new_at(id, Instant::now())
    }

    pub fn new_at(id: SessionId, now: Instant) -> Self {
        SessionState {
            id,
            window: Mutex::new(Window {
                samples: VecDeque::new(),
                last_generation_at: None,
                last_activity_at: now,
                removed: false,
            }),
            generation_in_flight: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &SessionId { &self.id }

    fn lock(&self) -> MutexGuard<'_, Window> {
        // The guarded section never panics mid-update, so a poisoned lock
        // still holds a consistent window.
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Buffer ────────────────────────────────────────────────────────────────

    /// Append `samples` in order, evicting from the head down to
    /// [`BUFFER_CAPACITY`].  Returns the buffer length after the trim.
    pub fn append(&self, samples: &[f32]) -> Result<usize, SessionError> {
        self.append_at(samples, Instant::now())
    }

    pub fn append_at(&self, samples: &[f32], now: Instant) -> Result<usize, SessionError> {
        let mut w = self.lock();
        if w.removed {
            return Err(SessionError::NotFound(self.id.clone()));
        }
        // Only the newest BUFFER_CAPACITY samples of an oversized batch survive.
        let skip = samples.len().saturating_sub(BUFFER_CAPACITY);
        w.samples.extend(&samples[skip..]);
        let excess = w.samples.len().saturating_sub(BUFFER_CAPACITY);
        w.samples.drain(..excess);
        w.last_activity_at = now;
        Ok(w.samples.len())
    }

    pub fn len(&self) -> usize { self.lock().samples.len() }

    /// Copy of the whole buffer, oldest first.
    pub fn snapshot(&self) -> Vec<f32> {
        self.lock().samples.iter().copied().collect()
    }

    /// The most recent `n` samples in chronological order.
    ///
    /// Never returns a short window: fewer than `n` buffered samples is an
    /// [`SessionError::InsufficientSamples`].
    pub fn extract_window(&self, n: usize) -> Result<Vec<f32>, SessionError> {
        let w = self.lock();
        let available = w.samples.len();
        if available < n {
            return Err(SessionError::InsufficientSamples { available, required: n });
        }
        Ok(w.samples.range(available - n..).copied().collect())
    }

    // ── Trigger gating ────────────────────────────────────────────────────────

    pub fn can_trigger(&self) -> bool {
        self.can_trigger_at(Instant::now())
    }

    /// `true` iff the buffer holds at least [`TRIGGER_THRESHOLD`] samples and
    /// [`COOLDOWN`] has elapsed since the last trigger (never triggered
    /// counts as elapsed).
    pub fn can_trigger_at(&self, now: Instant) -> bool {
        let w = self.lock();
        if w.removed || w.samples.len() < TRIGGER_THRESHOLD {
            return false;
        }
        match w.last_generation_at {
            None => true,
            Some(t) => now.saturating_duration_since(t) >= COOLDOWN,
        }
    }

    pub fn mark_generated(&self) {
        self.mark_generated_at(Instant::now());
    }

    /// Start the cooldown.  The timestamp never moves backwards, and a
    /// removed session keeps whatever it had.
    pub fn mark_generated_at(&self, now: Instant) {
        let mut w = self.lock();
        if w.removed {
            return;
        }
        if w.last_generation_at.map_or(true, |t| now > t) {
            w.last_generation_at = Some(now);
        }
    }

    pub fn last_generation_at(&self) -> Option<Instant> { self.lock().last_generation_at }

    // ── In-flight flag ────────────────────────────────────────────────────────

    /// Claim the single generation slot.  `false` means a call is already
    /// outstanding (or the session is gone) and the caller must not proceed.
    pub fn try_begin_generation(&self) -> bool {
        if self.is_removed() {
            return false;
        }
        self.generation_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_generation(&self) {
        self.generation_in_flight.store(false, Ordering::Release);
    }

    pub fn is_generating(&self) -> bool {
        self.generation_in_flight.load(Ordering::Acquire)
    }

    // ── Activity / lifecycle ──────────────────────────────────────────────────

    pub fn last_activity_at(&self) -> Instant { self.lock().last_activity_at }

    /// Time since the last buffer mutation, as seen at `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.lock().last_activity_at)
    }

    pub fn is_removed(&self) -> bool { self.lock().removed }

    pub fn phase(&self) -> SessionPhase {
        if self.is_removed() {
            SessionPhase::Removed
        } else if self.is_generating() {
            SessionPhase::Generating
        } else {
            SessionPhase::Active
        }
    }

    /// Make the session terminal: release the buffer and drop in-flight
    /// bookkeeping so a late generation result finds nothing to deliver to.
    pub(super) fn terminate(&self) {
        {
            let mut w = self.lock();
            w.removed = true;
            w.samples = VecDeque::new();
        }
        self.generation_in_flight.store(false, Ordering::Release);
    }
}
