//! Generation coordinator: turns a sample batch into an [`Outcome`].
//!
//! Flow for one batch:
//!   1. Resolve the session (absent → "Session not found")
//!   2. Validate the batch (empty / non-finite → validation error)
//!   3. Append to the sliding window
//!   4. Gate on threshold + cooldown, then claim the in-flight slot
//!   5. Extract the 1280-sample window and start the cooldown
//!   6. Call the generator under a 30s bound; drop the result if the session
//!      was removed meanwhile
//!
//! Steps 1–5 are synchronous ([`GenerationCoordinator::dispatch`]); step 6 is
//! the only suspension point ([`GenerationCoordinator::generate`]), so a
//! transport can keep buffering a connection's batches while its generation
//! is outstanding.

use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::generator::{GenerateError, Generator, GENERATION_TIMEOUT};
use crate::session::{SessionError, SessionId, SessionRegistry, SessionState, TRIGGER_THRESHOLD};

const BUFFERED_MESSAGE: &str = "Data received and buffered";
const SUCCESS_MESSAGE:  &str = "Music generated successfully";

/// What the transport should relay back for a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Generated audio, base64-encoded.
    Success { audio: String },
    Error { message: String },
    Buffering { message: String },
}

impl Outcome {
    pub fn success(audio: impl Into<String>) -> Self { Outcome::Success { audio: audio.into() } }

    pub fn error(message: impl Into<String>) -> Self { Outcome::Error { message: message.into() } }

    pub fn buffering() -> Self { Outcome::Buffering { message: BUFFERED_MESSAGE.into() } }

    /// Human-readable message accompanying the outcome.
    pub fn message(&self) -> &str {
        match self {
            Outcome::Success { .. } => SUCCESS_MESSAGE,
            Outcome::Error { message } | Outcome::Buffering { message } => message,
        }
    }
}

/// Result of the synchronous half of batch handling.
#[derive(Debug)]
pub enum Dispatch {
    /// Reply immediately; no generation was started.
    Reply(Outcome),
    /// A generation was committed; run it with [`GenerationCoordinator::generate`].
    Generate(GenerationJob),
}

/// A committed generation: the extracted window plus the session's claimed
/// in-flight slot.  The slot is released when the job is consumed or dropped.
#[derive(Debug)]
pub struct GenerationJob {
    window: Vec<f32>,
    slot:   InFlightSlot,
}

impl GenerationJob {
    pub fn session_id(&self) -> &SessionId { self.slot.0.id() }

    pub fn window(&self) -> &[f32] { &self.window }
}

#[derive(Debug)]
struct InFlightSlot(Arc<SessionState>);

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.0.end_generation();
    }
}

pub struct GenerationCoordinator<G> {
    registry:  SessionRegistry,
    generator: Arc<G>,
}

impl<G: Generator> GenerationCoordinator<G> {
    pub fn new(registry: SessionRegistry, generator: Arc<G>) -> Self {
        GenerationCoordinator { registry, generator }
    }

    /// Buffer a batch and return either the immediate reply or the committed
    /// generation job.
    pub fn dispatch(&self, id: &str, samples: &[f32]) -> Dispatch {
        let Some(session) = self.registry.get(id) else {
            warn!("batch for unknown session {id}");
            return Dispatch::Reply(Outcome::error("Session not found"));
        };

        if let Err(reason) = validate(samples) {
            return Dispatch::Reply(Outcome::error(reason));
        }

        match session.append(samples) {
            Ok(len) => debug!("session {id}: +{} samples, buffer={len}", samples.len()),
            Err(SessionError::NotFound(_)) => {
                return Dispatch::Reply(Outcome::error("Session not found"));
            }
            Err(e) => return Dispatch::Reply(Outcome::error(e.to_string())),
        }

        if !session.can_trigger() || !session.try_begin_generation() {
            return Dispatch::Reply(Outcome::buffering());
        }
        let slot = InFlightSlot(Arc::clone(&session));
        // A previous job may have completed between the check and the claim.
        if !session.can_trigger() {
            return Dispatch::Reply(Outcome::buffering());
        }

        let window = match session.extract_window(TRIGGER_THRESHOLD) {
            Ok(w) => w,
            Err(e) => {
                warn!("session {id}: aborting generation: {e}");
                return Dispatch::Reply(Outcome::error("Insufficient samples for generation"));
            }
        };
        // Cooldown starts now, even if the call later fails.
        session.mark_generated();
        info!("session {id}: generation triggered ({} samples)", window.len());
        Dispatch::Generate(GenerationJob { window, slot })
    }

    /// Run a committed job against the generator.  Returns `None` when the
    /// session was removed while the call was outstanding.
    pub async fn generate(&self, job: GenerationJob) -> Option<Outcome> {
        let GenerationJob { window, slot } = job;
        let session = Arc::clone(&slot.0);
        let id = session.id().clone();

        let call = self.generator.predict(window, GENERATION_TIMEOUT);
        let result = match tokio::time::timeout(GENERATION_TIMEOUT, call).await {
            Ok(r) => r,
            Err(_) => Err(GenerateError::Timeout(GENERATION_TIMEOUT)),
        };
        drop(slot);

        let outcome = match result {
            Ok(audio) => {
                info!("session {id}: generation succeeded ({} bytes base64)", audio.len());
                Outcome::success(audio)
            }
            Err(e) => {
                error!("session {id}: generation failed: {e}");
                Outcome::error(e.user_message())
            }
        };

        if session.is_removed() {
            info!("session {id}: closed during generation; discarding result");
            return None;
        }
        Some(outcome)
    }

    /// Full handling of one batch.  `None` only when a generation result was
    /// discarded because the session went away.
    pub async fn handle_incoming(&self, id: &str, samples: &[f32]) -> Option<Outcome> {
        match self.dispatch(id, samples) {
            Dispatch::Reply(outcome) => Some(outcome),
            Dispatch::Generate(job) => self.generate(job).await,
        }
    }
}

fn validate(samples: &[f32]) -> Result<(), &'static str> {
    if samples.is_empty() {
        return Err("Invalid EEG data: signal data is null or empty");
    }
    if samples.iter().any(|v| !v.is_finite()) {
        return Err("Invalid EEG data: signal data contains non-finite values");
    }
    Ok(())
}
