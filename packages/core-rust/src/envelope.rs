//! The envelope: the unit of work carried from producers through dispatch.
//!
//! An envelope wraps a serialized message payload with its routing and delivery
//! state. Producers create envelopes; only the dispatcher moves them through
//! their status lifecycle:
//!
//! ```text
//! Incoming -> Handled
//!          -> Scheduled -> Incoming -> ...
//!          -> DeadLettered | Failed
//! ```
//!
//! `Handled` envelopes are sealed: every mutator returns
//! [`EnvelopeError::Sealed`]. `DeadLettered` and `Failed` envelopes refuse
//! further delivery until an operator calls [`Envelope::revive`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::CallerIdentity;
use crate::message::{Message, JSON_CONTENT_TYPE};

/// Delivery status of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeStatus {
    /// Waiting for (or undergoing) a delivery attempt.
    Incoming,
    /// A failed attempt was recorded; the next attempt is due at `scheduled_at_ms`.
    Scheduled,
    /// Successfully handled and committed. Terminal and immutable.
    Handled,
    /// Retries exhausted; forwarded to the dead-letter destination.
    DeadLettered,
    /// Retries exhausted with no dead-letter destination to forward to.
    Failed,
}

impl EnvelopeStatus {
    /// Whether the dispatcher may start an attempt on an envelope in this status.
    #[must_use]
    pub fn accepts_delivery(self) -> bool {
        matches!(self, Self::Incoming | Self::Scheduled)
    }
}

/// Failure details attached when an envelope is retried or dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureContext {
    /// Display form of the most recent fault.
    pub summary: String,
    /// Attempts made when the failure was recorded.
    pub attempts: u32,
    /// Milliseconds since Unix epoch of the first recorded failure.
    pub first_failure_ms: u64,
    /// Milliseconds since Unix epoch of the most recent failure.
    pub last_failure_ms: u64,
}

/// Errors raised by envelope construction and state transitions.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope {id} is handled and can no longer change")]
    Sealed { id: Uuid },
    #[error("envelope {id} is {status:?}; delivery requires operator action")]
    NotDeliverable { id: Uuid, status: EnvelopeStatus },
    #[error("envelope carries {actual}, not {expected}")]
    TypeMismatch {
        expected: &'static str,
        actual: String,
    },
    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Message container flowing through the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: Uuid,
    message_type: String,
    payload: serde_json::Value,
    destination: Option<String>,
    status: EnvelopeStatus,
    attempts: u32,
    correlation_id: Uuid,
    content_type: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    caller: Option<CallerIdentity>,
    scheduled_at_ms: Option<u64>,
    failure: Option<FailureContext>,
}

impl Envelope {
    /// Wraps a typed message. The correlation id starts as a fresh identifier;
    /// use [`Envelope::with_correlation_id`] to continue an existing conversation.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Payload`] if the message cannot be serialized.
    pub fn new<M: Message>(message: &M) -> Result<Self, EnvelopeError> {
        let payload = serde_json::to_value(message)?;
        let mut envelope = Self::from_parts(M::MESSAGE_TYPE, payload);
        envelope.content_type = M::CONTENT_TYPE.to_string();
        Ok(envelope)
    }

    /// Builds an envelope from an already serialized payload.
    #[must_use]
    pub fn from_parts(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: message_type.into(),
            payload,
            destination: None,
            status: EnvelopeStatus::Incoming,
            attempts: 0,
            correlation_id: Uuid::new_v4(),
            content_type: JSON_CONTENT_TYPE.to_string(),
            headers: BTreeMap::new(),
            caller: None,
            scheduled_at_ms: None,
            failure: None,
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_caller(mut self, caller: CallerIdentity) -> Self {
        self.caller = Some(caller);
        self
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    #[must_use]
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    #[must_use]
    pub fn status(&self) -> EnvelopeStatus {
        self.status
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    #[must_use]
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn caller(&self) -> Option<&CallerIdentity> {
        self.caller.as_ref()
    }

    #[must_use]
    pub fn scheduled_at_ms(&self) -> Option<u64> {
        self.scheduled_at_ms
    }

    #[must_use]
    pub fn failure(&self) -> Option<&FailureContext> {
        self.failure.as_ref()
    }

    /// Deserializes the payload as `M`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::TypeMismatch`] when the envelope carries a
    /// different message type, or [`EnvelopeError::Payload`] when the payload
    /// does not deserialize.
    pub fn message<M: Message>(&self) -> Result<M, EnvelopeError> {
        if self.message_type != M::MESSAGE_TYPE {
            return Err(EnvelopeError::TypeMismatch {
                expected: M::MESSAGE_TYPE,
                actual: self.message_type.clone(),
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Attaches the resolved destination.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Sealed`] on a handled envelope.
    pub fn set_destination(&mut self, destination: impl Into<String>) -> Result<(), EnvelopeError> {
        self.ensure_open()?;
        self.destination = Some(destination.into());
        Ok(())
    }

    /// Puts a scheduled envelope back into `Incoming` for its next attempt.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::NotDeliverable`] unless the envelope is
    /// `Incoming` or `Scheduled`, or [`EnvelopeError::Sealed`] if handled.
    pub fn begin_attempt(&mut self) -> Result<(), EnvelopeError> {
        self.ensure_open()?;
        if !self.status.accepts_delivery() {
            return Err(EnvelopeError::NotDeliverable {
                id: self.id,
                status: self.status,
            });
        }
        self.status = EnvelopeStatus::Incoming;
        self.scheduled_at_ms = None;
        Ok(())
    }

    /// Records a failed attempt: increments the attempt count and updates the
    /// failure context. Returns the new attempt count.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Sealed`] on a handled envelope.
    pub fn record_failure(&mut self, summary: impl Into<String>, now_ms: u64) -> Result<u32, EnvelopeError> {
        self.ensure_open()?;
        self.attempts += 1;
        self.note_failure(summary.into(), now_ms);
        Ok(self.attempts)
    }

    /// Records an interrupted attempt without consuming an attempt.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Sealed`] on a handled envelope.
    pub fn record_interruption(&mut self, summary: impl Into<String>, now_ms: u64) -> Result<(), EnvelopeError> {
        self.ensure_open()?;
        self.note_failure(summary.into(), now_ms);
        Ok(())
    }

    fn note_failure(&mut self, summary: String, now_ms: u64) {
        let first_failure_ms = self
            .failure
            .as_ref()
            .map_or(now_ms, |f| f.first_failure_ms);
        self.failure = Some(FailureContext {
            summary,
            attempts: self.attempts,
            first_failure_ms,
            last_failure_ms: now_ms,
        });
    }

    /// Moves the envelope to `Scheduled` with its next attempt due at `at_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Sealed`] on a handled envelope.
    pub fn schedule(&mut self, at_ms: u64) -> Result<(), EnvelopeError> {
        self.ensure_open()?;
        self.status = EnvelopeStatus::Scheduled;
        self.scheduled_at_ms = Some(at_ms);
        Ok(())
    }

    /// Seals the envelope as handled.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Sealed`] if it already is.
    pub fn mark_handled(&mut self) -> Result<(), EnvelopeError> {
        self.ensure_open()?;
        self.status = EnvelopeStatus::Handled;
        self.scheduled_at_ms = None;
        Ok(())
    }

    /// Marks the envelope dead-lettered, pointing it at the dead-letter destination.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Sealed`] on a handled envelope.
    pub fn mark_dead_lettered(&mut self, dead_letter: impl Into<String>) -> Result<(), EnvelopeError> {
        self.ensure_open()?;
        self.status = EnvelopeStatus::DeadLettered;
        self.scheduled_at_ms = None;
        self.destination = Some(dead_letter.into());
        Ok(())
    }

    /// Marks the envelope failed when no dead-letter destination exists.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Sealed`] on a handled envelope.
    pub fn mark_failed(&mut self) -> Result<(), EnvelopeError> {
        self.ensure_open()?;
        self.status = EnvelopeStatus::Failed;
        self.scheduled_at_ms = None;
        Ok(())
    }

    /// Operator action: makes a dead-lettered or failed envelope deliverable
    /// again with a fresh attempt budget.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Sealed`] on a handled envelope.
    pub fn revive(&mut self) -> Result<(), EnvelopeError> {
        self.ensure_open()?;
        tracing::debug!(envelope_id = %self.id, from = ?self.status, attempts = self.attempts, "envelope revived");
        self.status = EnvelopeStatus::Incoming;
        self.attempts = 0;
        self.scheduled_at_ms = None;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), EnvelopeError> {
        if self.status == EnvelopeStatus::Handled {
            return Err(EnvelopeError::Sealed { id: self.id });
        }
        Ok(())
    }
}
