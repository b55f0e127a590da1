//! Error taxonomy for the runtime.
//!
//! Startup errors ([`CompilationError`], [`ConfigurationError`], [`RoutingError`],
//! collected under [`StartupError`]) abort `Runtime::build`. Per-envelope errors
//! ([`ExecutionFault`], [`TransportFault`]) never escape the dispatcher: they are
//! folded into the retry/dead-letter state machine.

use courier_core::EnvelopeError;

/// Conflicting or malformed declarations discovered while building a chain.
#[derive(Debug, thiserror::Error)]
pub enum CompilationError {
    #[error("{handler}: conflicting resource type overrides `{first}` ({first_origin}) and `{second}` ({second_origin})")]
    ConflictingResourceType {
        handler: String,
        first: String,
        first_origin: &'static str,
        second: String,
        second_origin: &'static str,
    },
    #[error("{handler}: status {status} is mapped to {first} ({first_origin}) and {second} ({second_origin})")]
    ConflictingStatusMapping {
        handler: String,
        status: u16,
        first: String,
        first_origin: &'static str,
        second: String,
        second_origin: &'static str,
    },
    #[error("{handler}: more than one route declared on the {origin}")]
    DuplicateRoute {
        handler: String,
        origin: &'static str,
    },
    #[error("{handler}: route parameter `{parameter}` does not appear in `{pattern}`")]
    UnknownRouteParameter {
        handler: String,
        parameter: String,
        pattern: String,
    },
    #[error("{handler}: more than one body parameter declared")]
    MultipleBodies { handler: String },
    #[error("message type {message_type} is handled by both {first} and {second}")]
    DuplicateHandler {
        message_type: String,
        first: String,
        second: String,
    },
}

/// A binding the runtime needs is missing or invalid.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("{handler}: missing outbox binding (handler publishes through a message bus but no outbox store is configured)")]
    MissingOutboxBinding { handler: String },
    #[error("no transport endpoint configured")]
    MissingTransport,
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Destination resolution failures, surfaced during startup validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("message type {message_type} is not registered")]
    UnknownMessageType { message_type: String },
    #[error("message types {first} and {second} both resolve to destination {destination}")]
    DuplicateDestination {
        destination: String,
        first: String,
        second: String,
    },
    #[error("name {alias} is claimed by both {first} and {second}")]
    Collision {
        alias: String,
        first: String,
        second: String,
    },
    #[error("message type {message_type} has no routing rule")]
    Unrouted { message_type: String },
}

/// Any error that aborts runtime initialization.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Compilation(#[from] CompilationError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

/// Failure of the backing transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportFault {
    #[error("envelope {envelope_id} has no destination")]
    NoDestination { envelope_id: uuid::Uuid },
    #[error("send to {destination} failed: {reason}")]
    Send { destination: String, reason: String },
    #[error("receive failed: {0}")]
    Receive(String),
}

/// Failure of the outbox store or its unit-of-work.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("unit of work could not begin: {0}")]
    Begin(String),
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("rollback failed: {0}")]
    Rollback(String),
    #[error("outbox backend error: {0}")]
    Backend(String),
}

/// A fault raised while executing a chain for one envelope.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionFault {
    /// The handler or a middleware step returned an error.
    #[error("handler fault: {0:#}")]
    Handler(#[from] anyhow::Error),
    /// The caller's cancellation signal fired mid-execution.
    #[error("execution cancelled")]
    Cancelled,
    /// The chain ran past the per-attempt deadline.
    #[error("execution timed out after {after:?}")]
    TimedOut { after: std::time::Duration },
    /// The handler used a capability it did not declare.
    #[error("{capability} used without declaring it")]
    Undeclared { capability: &'static str },
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Outbox(#[from] OutboxError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Transport(#[from] TransportFault),
}

impl ExecutionFault {
    /// Operator-initiated interruptions retry without consuming an attempt and
    /// never dead-letter.
    #[must_use]
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Pipeline-level rejection of a delivery before any chain runs.
///
/// Rejections that leave the envelope untouched hand it back so the caller
/// can redeliver it.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("runtime is overloaded, try again later")]
    Overloaded { envelope: Box<courier_core::Envelope> },
    #[error("runtime is not accepting deliveries")]
    NotAccepting { envelope: Box<courier_core::Envelope> },
    #[error("no chain compiled for message type {message_type}")]
    UnknownChain { message_type: String },
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    /// Retries ran out, the dead-letter send failed and no store can keep the
    /// envelope. The caller still owns it and must redeliver.
    #[error("dead letter for envelope {} could not be sent: {source}", .envelope.id())]
    DeadLetterUndeliverable {
        envelope: Box<courier_core::Envelope>,
        source: TransportFault,
    },
}

impl DispatchError {
    /// The rejected envelope, when the error carries it back.
    #[must_use]
    pub fn into_envelope(self) -> Option<courier_core::Envelope> {
        match self {
            Self::Overloaded { envelope }
            | Self::NotAccepting { envelope }
            | Self::DeadLetterUndeliverable { envelope, .. } => Some(*envelope),
            Self::UnknownChain { .. } | Self::Envelope(_) => None,
        }
    }
}
