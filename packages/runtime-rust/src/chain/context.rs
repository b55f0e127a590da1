//! Per-execution state handed to steps and the terminal handler.

use courier_core::{Envelope, Message};
use http::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutionFault;
use crate::traits::UnitOfWork;

/// Status and body a chain wants to answer with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub status: Option<StatusCode>,
    pub body: Option<serde_json::Value>,
}

/// Buffers envelopes published while handling one incoming envelope.
///
/// Nothing published here leaves the process until the unit of work commits.
#[derive(Debug)]
pub struct MessageBus {
    correlation_id: uuid::Uuid,
    outgoing: Vec<Envelope>,
}

impl MessageBus {
    pub(crate) fn new(correlation_id: uuid::Uuid) -> Self {
        Self {
            correlation_id,
            outgoing: Vec::new(),
        }
    }

    /// Publish a typed message, continuing the incoming correlation.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be serialized.
    pub fn publish<M: Message>(&mut self, message: &M) -> Result<(), ExecutionFault> {
        let envelope = Envelope::new(message)?;
        self.publish_envelope(envelope);
        Ok(())
    }

    /// Publish a prebuilt envelope, continuing the incoming correlation.
    pub fn publish_envelope(&mut self, envelope: Envelope) {
        self.outgoing
            .push(envelope.with_correlation_id(self.correlation_id));
    }

    #[must_use]
    pub fn outgoing(&self) -> &[Envelope] {
        &self.outgoing
    }

    pub(crate) fn into_outgoing(self) -> Vec<Envelope> {
        self.outgoing
    }
}

/// Everything a step or handler can see and touch during one execution.
pub struct HandlerContext<'a> {
    envelope: &'a Envelope,
    unit_of_work: &'a mut dyn UnitOfWork,
    bus: Option<MessageBus>,
    cancel: CancellationToken,
    reply: Reply,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        envelope: &'a Envelope,
        unit_of_work: &'a mut dyn UnitOfWork,
        with_bus: bool,
        cancel: CancellationToken,
    ) -> Self {
        let bus = with_bus.then(|| MessageBus::new(envelope.correlation_id()));
        Self {
            envelope,
            unit_of_work,
            bus,
            cancel,
            reply: Reply::default(),
        }
    }

    #[must_use]
    pub fn envelope(&self) -> &'a Envelope {
        self.envelope
    }

    /// Deserialize the incoming message.
    ///
    /// # Errors
    ///
    /// Returns an error when the envelope carries another type or the payload
    /// does not deserialize.
    pub fn message<M: Message>(&self) -> Result<M, ExecutionFault> {
        Ok(self.envelope.message::<M>()?)
    }

    /// The message bus, if the handler declared a dependency on it.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionFault::Undeclared`] when the chain was compiled
    /// without a message bus parameter.
    pub fn bus(&mut self) -> Result<&mut MessageBus, ExecutionFault> {
        self.bus.as_mut().ok_or(ExecutionFault::Undeclared {
            capability: "message bus",
        })
    }

    /// Stage a state change in the current unit of work.
    pub fn stage(&mut self, key: &str, value: serde_json::Value) {
        self.unit_of_work.stage(key, value);
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Set the status and body the chain answers with.
    pub fn respond(&mut self, status: StatusCode, body: Option<serde_json::Value>) {
        self.reply = Reply {
            status: Some(status),
            body,
        };
    }

    #[must_use]
    pub fn reply(&self) -> &Reply {
        &self.reply
    }

    pub(crate) fn into_parts(self) -> (Vec<Envelope>, Reply) {
        let outgoing = self.bus.map(MessageBus::into_outgoing).unwrap_or_default();
        (outgoing, self.reply)
    }
}
