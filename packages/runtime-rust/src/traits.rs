use async_trait::async_trait;
use courier_core::Envelope;
use uuid::Uuid;

use crate::error::{OutboxError, TransportFault};

/// One envelope's transaction against the outbox store.
///
/// State changes and outgoing envelopes are only buffered until [`commit`],
/// which must persist both atomically. After [`rollback`] nothing buffered
/// is observable.
///
/// [`commit`]: UnitOfWork::commit
/// [`rollback`]: UnitOfWork::rollback
#[async_trait]
pub trait UnitOfWork: Send {
    /// Stage an application state change under `key`.
    fn stage(&mut self, key: &str, value: serde_json::Value);

    /// Buffer an outgoing envelope. It becomes pending in the outbox on commit.
    fn buffer_outgoing(&mut self, envelope: Envelope);

    /// Atomically persist staged changes and buffered envelopes, and record the
    /// incoming envelope as handled. Returns the envelopes now pending delivery,
    /// already claimed by the caller.
    async fn commit(&mut self) -> Result<Vec<Envelope>, OutboxError>;

    /// Discard everything buffered in this unit of work.
    async fn rollback(&mut self) -> Result<(), OutboxError>;
}

/// Durable outbox backend.
/// Implementations: in-memory (tests, local pipelines); SQL backends live outside this crate.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Open a unit of work for handling `incoming`.
    async fn begin(&self, incoming: &Envelope) -> Result<Box<dyn UnitOfWork>, OutboxError>;

    /// Whether a unit of work for this incoming envelope already committed.
    async fn is_handled(&self, incoming: Uuid) -> Result<bool, OutboxError>;

    /// Committed outgoing envelopes not yet confirmed as sent, oldest first,
    /// claimed or not.
    async fn pending(&self) -> Result<Vec<Envelope>, OutboxError>;

    /// Claim unclaimed pending envelopes, oldest first. With `origin`, only
    /// envelopes recorded while handling that incoming envelope are claimed.
    ///
    /// A claimed envelope is invisible to other claimers until it is flushed
    /// or released, so two flushers never send the same row.
    async fn claim_pending(&self, origin: Option<Uuid>) -> Result<Vec<Envelope>, OutboxError>;

    /// Return claimed envelopes that could not be sent to the pending set.
    async fn release(&self, ids: &[Uuid]) -> Result<(), OutboxError>;

    /// Record `envelope` as pending outside any unit of work, unclaimed.
    /// Used for envelopes whose send failed after the attempt was settled.
    async fn append_pending(&self, origin: Uuid, envelope: Envelope) -> Result<(), OutboxError>;

    /// Remove delivered envelopes from the pending set.
    async fn mark_flushed(&self, ids: &[Uuid]) -> Result<(), OutboxError>;
}

/// A backing transport. Envelopes are routed by their resolved destination.
#[async_trait]
pub trait TransportEndpoint: Send + Sync {
    /// Deliver an envelope to its destination.
    async fn send(&self, envelope: Envelope) -> Result<(), TransportFault>;

    /// Take the next inbound envelope, if any is waiting.
    async fn receive(&self) -> Result<Option<Envelope>, TransportFault>;
}
