//! Per-connection signal sessions.
//!
//! A session owns the sliding sample window of one client connection plus
//! the timers and in-flight flag that gate generation.  Sessions live only
//! inside the [`registry::SessionRegistry`]; once removed they are terminal.

pub mod registry;
pub mod state;

use std::borrow::Borrow;
use std::time::Duration;

use thiserror::Error;

pub use registry::SessionRegistry;
pub use state::{SessionPhase, SessionState};

/// Maximum samples retained per session; older samples are evicted first.
pub const BUFFER_CAPACITY: usize = 2000;
/// Samples required before a generation may trigger, and the window size.
pub const TRIGGER_THRESHOLD: usize = 1280;
/// Minimum interval between two generation triggers of one session.
pub const COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("insufficient samples: {available} buffered, {required} required")]
    InsufficientSamples { available: usize, required: usize },
    #[error("resource limit: {0}")]
    ResourceExhausted(String),
}

/// Opaque connection identifier assigned by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(s: impl Into<String>) -> Self { SessionId(s.into()) }

    /// Fresh random identifier for a newly accepted connection.
    pub fn generate() -> Self {
        SessionId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str { &self.0 }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self { SessionId(s.to_string()) }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
