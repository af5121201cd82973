//! Transport-facing entry points.
//!
//! A transport reports three lifecycle events per connection: connect,
//! sample batch, disconnect.  [`Engine`] routes them to the governor, the
//! registry and the coordinator; it holds no state of its own.

use std::sync::Arc;

use log::{info, warn};

use crate::coordinator::{Dispatch, GenerationCoordinator};
use crate::generator::Generator;
use crate::governor::ResourceGovernor;
use crate::session::{SessionError, SessionId, SessionRegistry, SessionState};

pub struct Engine<G> {
    registry:    SessionRegistry,
    coordinator: GenerationCoordinator<G>,
    governor:    Arc<ResourceGovernor>,
}

impl<G: Generator> Engine<G> {
    pub fn new(registry: SessionRegistry, generator: Arc<G>, governor: Arc<ResourceGovernor>) -> Self {
        Engine {
            coordinator: GenerationCoordinator::new(registry.clone(), generator),
            registry,
            governor,
        }
    }

    pub fn registry(&self) -> &SessionRegistry { &self.registry }

    pub fn coordinator(&self) -> &GenerationCoordinator<G> { &self.coordinator }

    pub fn governor(&self) -> &Arc<ResourceGovernor> { &self.governor }

    /// Admit a new connection.  Under pressure, idle sessions are swept
    /// first so the newcomer has a chance.
    pub fn on_connect(&self, id: SessionId) -> Result<Arc<SessionState>, SessionError> {
        if self.governor.is_under_pressure() {
            self.governor.relieve_pressure();
        }
        if let Err(e) = self.governor.admit() {
            warn!("rejecting connection for session {id}: {e}");
            return Err(e);
        }
        let session = self.registry.create(id);
        info!("session {} accepted. {}", session.id(), self.governor.utilization_summary());
        Ok(session)
    }

    pub fn on_samples(&self, id: &str, samples: &[f32]) -> Dispatch {
        self.coordinator.dispatch(id, samples)
    }

    pub fn on_disconnect(&self, id: &str) {
        if self.registry.remove(id).is_some() {
            info!("session {id} closed and cleaned up");
        }
    }
}
