//! Observation of per-envelope dispatch transitions.

use std::fmt;

use courier_core::Envelope;
use parking_lot::Mutex;

/// States an envelope passes through while being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchState {
    Received,
    Executing,
    Committed,
    Sent,
    Failed,
    Retrying,
    DeadLettered,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Executing => "executing",
            Self::Committed => "committed",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::DeadLettered => "dead_lettered",
        };
        f.write_str(name)
    }
}

/// Hook invoked on every dispatch transition.
///
/// Hooks run inline on the dispatching task and should avoid heavy or
/// blocking work.
pub trait DispatchHook: Send + Sync {
    fn on_transition(&self, envelope: &Envelope, state: DispatchState);
}

/// Logs transitions with `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDispatchHook;

impl DispatchHook for TracingDispatchHook {
    fn on_transition(&self, envelope: &Envelope, state: DispatchState) {
        match state {
            DispatchState::Failed | DispatchState::Retrying => tracing::warn!(
                envelope_id = %envelope.id(),
                message_type = envelope.message_type(),
                attempts = envelope.attempts(),
                %state,
                "dispatch transition"
            ),
            DispatchState::DeadLettered => tracing::error!(
                envelope_id = %envelope.id(),
                message_type = envelope.message_type(),
                attempts = envelope.attempts(),
                destination = envelope.destination(),
                "envelope dead-lettered"
            ),
            _ => tracing::debug!(
                envelope_id = %envelope.id(),
                message_type = envelope.message_type(),
                %state,
                "dispatch transition"
            ),
        }
    }
}

/// Records transitions in order, for inspection.
#[derive(Debug, Default)]
pub struct RecordingDispatchHook {
    transitions: Mutex<Vec<(uuid::Uuid, DispatchState)>>,
}

impl RecordingDispatchHook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every state recorded for one envelope, in order.
    #[must_use]
    pub fn states_for(&self, envelope_id: uuid::Uuid) -> Vec<DispatchState> {
        self.transitions
            .lock()
            .iter()
            .filter(|(id, _)| *id == envelope_id)
            .map(|(_, state)| *state)
            .collect()
    }

    #[must_use]
    pub fn all(&self) -> Vec<(uuid::Uuid, DispatchState)> {
        self.transitions.lock().clone()
    }
}

impl DispatchHook for RecordingDispatchHook {
    fn on_transition(&self, envelope: &Envelope, state: DispatchState) {
        self.transitions.lock().push((envelope.id(), state));
    }
}
