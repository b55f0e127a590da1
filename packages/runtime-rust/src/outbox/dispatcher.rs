//! The outbox dispatcher: runs a chain for one envelope inside a unit of work.
//!
//! One attempt ([`OutboxDispatcher::execute`]) begins a unit of work, runs the
//! compiled chain, routes and buffers everything the handler published,
//! commits, and only then sends the committed envelopes. A fault at any point
//! before commit rolls the unit of work back, so nothing buffered is ever sent.
//! The envelope is then scheduled for another attempt or dead-lettered.
//!
//! Per-envelope faults never escape as errors: they are folded into the
//! returned [`DispatchOutcome`]. [`DispatchError`] is reserved for deliveries
//! that cannot start at all.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use courier_core::{ClockSource, Envelope, SystemClock};
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::Instrument;
use uuid::Uuid;

use super::hook::{DispatchHook, DispatchState, TracingDispatchHook};
use super::memory::EphemeralUnitOfWork;
use super::retry::{RetryDecision, RetryPolicy};
use crate::chain::{Chain, ChainCache, ChainOutcome, HandlerContext, Reply};
use crate::error::{DispatchError, ExecutionFault, TransportFault};
use crate::routing::RoutingTable;
use crate::traits::{OutboxStore, TransportEndpoint, UnitOfWork};

/// One envelope handed to the dispatch pipeline, with the signal that
/// cancels its attempt.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    pub cancel: CancellationToken,
    /// Upper bound on chain execution for this attempt.
    pub deadline: Option<Duration>,
}

impl Delivery {
    #[must_use]
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Result of one dispatch attempt.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The chain completed and the unit of work committed.
    Handled {
        envelope: Envelope,
        result: ChainOutcome,
        reply: Reply,
        flush: FlushReport,
    },
    /// The envelope was already handled by an earlier commit; only its pending
    /// outgoing envelopes were flushed again.
    Duplicate { envelope: Envelope },
    /// The attempt failed and another one is scheduled after `delay`.
    Retrying {
        envelope: Envelope,
        delay: Duration,
        fault: String,
    },
    /// Retries exhausted; the envelope was sent to its dead-letter destination.
    DeadLettered { envelope: Envelope, fault: String },
    /// Retries exhausted with no dead-letter destination.
    Failed { envelope: Envelope, fault: String },
}

impl DispatchOutcome {
    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        match self {
            Self::Handled { envelope, .. }
            | Self::Duplicate { envelope }
            | Self::Retrying { envelope, .. }
            | Self::DeadLettered { envelope, .. }
            | Self::Failed { envelope, .. } => envelope,
        }
    }

    #[must_use]
    pub fn into_envelope(self) -> Envelope {
        match self {
            Self::Handled { envelope, .. }
            | Self::Duplicate { envelope }
            | Self::Retrying { envelope, .. }
            | Self::DeadLettered { envelope, .. }
            | Self::Failed { envelope, .. } => envelope,
        }
    }

    /// Metric label for this outcome.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Handled { .. } => "handled",
            Self::Duplicate { .. } => "duplicate",
            Self::Retrying { .. } => "retrying",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::Failed { .. } => "failed",
        }
    }

    #[must_use]
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Handled { .. } | Self::Duplicate { .. })
    }
}

/// What happened to the committed outgoing envelopes of one attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    /// Sent to their dead-letter destination after the send retries ran out.
    pub dead_lettered: usize,
    /// Still pending in the outbox, left for the relay.
    pub deferred: usize,
}

impl FlushReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.dead_lettered == 0 && self.deferred == 0
    }
}

enum SendOutcome {
    Sent,
    DeadLettered,
    Deferred,
}

/// Executes compiled chains with outbox semantics.
///
/// Cheap to clone; clones share the chain cache, routing table, store,
/// transport and hook.
#[derive(Clone)]
pub struct OutboxDispatcher {
    chains: Arc<ChainCache>,
    routing: Arc<RoutingTable>,
    store: Option<Arc<dyn OutboxStore>>,
    transport: Arc<dyn TransportEndpoint>,
    retry: RetryPolicy,
    hook: Arc<dyn DispatchHook>,
    clock: Arc<dyn ClockSource>,
}

impl OutboxDispatcher {
    #[must_use]
    pub fn new(
        chains: Arc<ChainCache>,
        routing: Arc<RoutingTable>,
        transport: Arc<dyn TransportEndpoint>,
    ) -> Self {
        Self {
            chains,
            routing,
            store: None,
            transport,
            retry: RetryPolicy::default(),
            hook: Arc::new(TracingDispatchHook),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn OutboxStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn DispatchHook>) -> Self {
        self.hook = hook;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    #[must_use]
    pub fn chains(&self) -> &Arc<ChainCache> {
        &self.chains
    }

    /// Run one attempt for `envelope`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Envelope`] when the envelope does not accept delivery
    /// (handled, dead-lettered or failed), and [`DispatchError::UnknownChain`]
    /// when no chain is compiled for its message type. Execution faults are
    /// reported through the returned outcome instead.
    pub async fn execute(
        &self,
        envelope: Envelope,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.execute_within(envelope, cancel, None).await
    }

    /// Like [`OutboxDispatcher::execute`], failing the attempt with
    /// [`ExecutionFault::TimedOut`] when the chain runs past `deadline`.
    ///
    /// # Errors
    ///
    /// See [`OutboxDispatcher::execute`].
    pub async fn execute_within(
        &self,
        mut envelope: Envelope,
        cancel: &CancellationToken,
        deadline: Option<Duration>,
    ) -> Result<DispatchOutcome, DispatchError> {
        envelope.begin_attempt()?;
        let chain = self
            .chains
            .get(envelope.message_type())
            .ok_or_else(|| DispatchError::UnknownChain {
                message_type: envelope.message_type().to_string(),
            })?;

        let span = tracing::info_span!(
            "dispatch",
            envelope_id = %envelope.id(),
            message_type = envelope.message_type(),
            attempt = envelope.attempts() + 1,
        );
        self.run(envelope, &chain, cancel, deadline).instrument(span).await
    }

    async fn run(
        &self,
        mut envelope: Envelope,
        chain: &Chain,
        cancel: &CancellationToken,
        deadline: Option<Duration>,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.hook.on_transition(&envelope, DispatchState::Received);

        if self.already_handled(envelope.id()).await {
            tracing::info!("envelope already handled, flushing its pending outgoing only");
            envelope.mark_handled()?;
            self.flush_claimed(Some(envelope.id())).await;
            return Ok(self.finish(DispatchOutcome::Duplicate { envelope }));
        }

        self.hook.on_transition(&envelope, DispatchState::Executing);
        let outcome = match self.attempt(&envelope, chain, cancel, deadline).await {
            Ok((pending, result, reply)) => {
                self.hook.on_transition(&envelope, DispatchState::Committed);
                envelope.mark_handled()?;
                let flush = self.flush(pending).await;
                if flush.is_complete() {
                    self.hook.on_transition(&envelope, DispatchState::Sent);
                }
                DispatchOutcome::Handled {
                    envelope,
                    result,
                    reply,
                    flush,
                }
            }
            Err(fault) => self.fail(envelope, &fault).await?,
        };
        Ok(self.finish(outcome))
    }

    /// Drive attempts for `envelope` until it is handled, dead-lettered or
    /// failed, sleeping between retries. Each attempt gets a child of `cancel`;
    /// once `cancel` itself fires the envelope is returned still scheduled.
    ///
    /// # Errors
    ///
    /// See [`OutboxDispatcher::execute`].
    pub async fn dispatch(
        &self,
        envelope: Envelope,
        cancel: CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError> {
        drive_attempts(envelope, cancel, |envelope, attempt_cancel| {
            let this = self.clone();
            async move { this.execute(envelope, &attempt_cancel).await }
        })
        .await
    }

    async fn already_handled(&self, id: Uuid) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store.is_handled(id).await {
            Ok(handled) => handled,
            Err(err) => {
                tracing::warn!(error = %err, "could not check handled marker, executing");
                false
            }
        }
    }

    /// Begin, execute, route, commit. On any fault the unit of work is rolled
    /// back before the fault is returned.
    async fn attempt(
        &self,
        envelope: &Envelope,
        chain: &Chain,
        cancel: &CancellationToken,
        deadline: Option<Duration>,
    ) -> Result<(Vec<Envelope>, ChainOutcome, Reply), ExecutionFault> {
        let mut uow: Box<dyn UnitOfWork> = match &self.store {
            Some(store) => store.begin(envelope).await?,
            None => Box::new(EphemeralUnitOfWork::default()),
        };

        let (executed, outgoing, reply) = {
            let mut ctx = HandlerContext::new(envelope, uow.as_mut(), chain.has_message_bus(), cancel.clone());
            let executed = match deadline {
                Some(after) => tokio::time::timeout(after, chain.execute(&mut ctx))
                    .await
                    .unwrap_or(Err(ExecutionFault::TimedOut { after })),
                None => chain.execute(&mut ctx).await,
            };
            let (outgoing, reply) = ctx.into_parts();
            (executed, outgoing, reply)
        };

        let result = match executed {
            Ok(result) => result,
            Err(fault) => return Err(abort(uow.as_mut(), fault).await),
        };

        for mut outgoing in outgoing {
            let destination = match self.routing.resolve(outgoing.message_type()) {
                Ok(rule) => rule.destination.clone(),
                Err(err) => return Err(abort(uow.as_mut(), err.into()).await),
            };
            if let Err(err) = outgoing.set_destination(destination) {
                return Err(abort(uow.as_mut(), err.into()).await);
            }
            uow.buffer_outgoing(outgoing);
        }

        if cancel.is_cancelled() {
            return Err(abort(uow.as_mut(), ExecutionFault::Cancelled).await);
        }
        match uow.commit().await {
            Ok(pending) => Ok((pending, result, reply)),
            Err(err) => Err(abort(uow.as_mut(), err.into()).await),
        }
    }

    async fn fail(&self, mut envelope: Envelope, fault: &ExecutionFault) -> Result<DispatchOutcome, DispatchError> {
        let now = self.clock.now();
        let summary = fault.to_string();
        let decision = if fault.is_interruption() {
            envelope.record_interruption(summary.clone(), now)?;
            self.retry.decide(envelope.attempts(), fault)
        } else {
            let attempts = envelope.record_failure(summary.clone(), now)?;
            self.retry.decide(attempts, fault)
        };
        tracing::warn!(fault = %summary, attempts = envelope.attempts(), ?decision, "dispatch attempt failed");

        match decision {
            RetryDecision::Retry { delay } => {
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                envelope.schedule(now.saturating_add(delay_ms))?;
                self.hook.on_transition(&envelope, DispatchState::Retrying);
                Ok(DispatchOutcome::Retrying {
                    envelope,
                    delay,
                    fault: summary,
                })
            }
            RetryDecision::DeadLetter => match self.routing.dead_letter_for(envelope.message_type()) {
                Some(dead_letter) => {
                    envelope.mark_dead_lettered(dead_letter)?;
                    if let Err(err) = self.transport.send(envelope.clone()).await {
                        metrics::counter!("courier_dead_letter_send_failures_total").increment(1);
                        self.park_dead_letter(&envelope, err).await?;
                    }
                    self.hook.on_transition(&envelope, DispatchState::DeadLettered);
                    Ok(DispatchOutcome::DeadLettered {
                        envelope,
                        fault: summary,
                    })
                }
                None => {
                    envelope.mark_failed()?;
                    self.hook.on_transition(&envelope, DispatchState::Failed);
                    Ok(DispatchOutcome::Failed {
                        envelope,
                        fault: summary,
                    })
                }
            },
        }
    }

    /// Keep a dead-lettered envelope whose send failed pending in the store,
    /// where the relay picks it up.
    async fn park_dead_letter(&self, envelope: &Envelope, fault: TransportFault) -> Result<(), DispatchError> {
        let Some(store) = &self.store else {
            return Err(DispatchError::DeadLetterUndeliverable {
                envelope: Box::new(envelope.clone()),
                source: fault,
            });
        };
        match store.append_pending(envelope.id(), envelope.clone()).await {
            Ok(()) => {
                tracing::warn!(error = %fault, "dead-letter send failed, envelope left pending for the relay");
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "could not keep undeliverable dead letter pending");
                Err(DispatchError::DeadLetterUndeliverable {
                    envelope: Box::new(envelope.clone()),
                    source: fault,
                })
            }
        }
    }

    /// Send claimed envelopes, retrying each per the retry policy. Envelopes
    /// that stay undelivered are released back to the store.
    async fn flush(&self, pending: Vec<Envelope>) -> FlushReport {
        let mut report = FlushReport::default();
        let mut deferred = Vec::new();
        for envelope in pending {
            let id = envelope.id();
            match self.send_with_retry(envelope).await {
                SendOutcome::Sent => report.sent += 1,
                SendOutcome::DeadLettered => report.dead_lettered += 1,
                SendOutcome::Deferred => deferred.push(id),
            }
        }
        report.deferred = deferred.len();
        if let (Some(store), false) = (&self.store, deferred.is_empty()) {
            if let Err(err) = store.release(&deferred).await {
                tracing::warn!(error = %err, "could not release deferred envelopes");
            }
        }
        report
    }

    /// Claim and flush every unclaimed pending envelope in the store.
    ///
    /// Returns the report, or `None` when there is no store.
    pub async fn flush_pending(&self) -> Option<FlushReport> {
        self.flush_claimed(None).await
    }

    async fn flush_claimed(&self, origin: Option<Uuid>) -> Option<FlushReport> {
        let store = self.store.as_ref()?;
        match store.claim_pending(origin).await {
            Ok(pending) => Some(self.flush(pending).await),
            Err(err) => {
                tracing::warn!(error = %err, "could not claim pending outbox envelopes");
                None
            }
        }
    }

    async fn send_with_retry(&self, envelope: Envelope) -> SendOutcome {
        let mut attempts = 0u32;
        let last_fault = loop {
            match self.transport.send(envelope.clone()).await {
                Ok(()) => {
                    metrics::counter!("courier_outgoing_sent_total").increment(1);
                    self.confirm_flushed(envelope.id()).await;
                    return SendOutcome::Sent;
                }
                Err(fault) => {
                    attempts += 1;
                    tracing::warn!(
                        envelope_id = %envelope.id(),
                        destination = envelope.destination(),
                        attempts,
                        error = %fault,
                        "outgoing send failed"
                    );
                    match self.retry.decide_attempt(attempts) {
                        RetryDecision::Retry { delay } => tokio::time::sleep(delay).await,
                        RetryDecision::DeadLetter => break fault.to_string(),
                    }
                }
            }
        };

        let Some(dead_letter) = self.routing.dead_letter_for(envelope.message_type()) else {
            return SendOutcome::Deferred;
        };
        let mut dead = envelope.clone();
        let marked = dead
            .record_failure(last_fault, self.clock.now())
            .and_then(|_| dead.mark_dead_lettered(dead_letter));
        if marked.is_err() {
            return SendOutcome::Deferred;
        }
        match self.transport.send(dead.clone()).await {
            Ok(()) => {
                self.hook.on_transition(&dead, DispatchState::DeadLettered);
                self.confirm_flushed(envelope.id()).await;
                SendOutcome::DeadLettered
            }
            Err(err) => {
                tracing::error!(error = %err, envelope_id = %envelope.id(), "outgoing envelope left pending");
                SendOutcome::Deferred
            }
        }
    }

    async fn confirm_flushed(&self, id: Uuid) {
        if let Some(store) = &self.store {
            if let Err(err) = store.mark_flushed(&[id]).await {
                tracing::warn!(error = %err, envelope_id = %id, "could not mark envelope flushed");
            }
        }
    }

    fn finish(&self, outcome: DispatchOutcome) -> DispatchOutcome {
        metrics::counter!("courier_dispatch_total", "outcome" => outcome.label()).increment(1);
        outcome
    }
}

async fn abort(uow: &mut dyn UnitOfWork, fault: ExecutionFault) -> ExecutionFault {
    if let Err(err) = uow.rollback().await {
        tracing::error!(error = %err, "rollback failed");
    }
    fault
}

/// Repeat `attempt` while it reports [`DispatchOutcome::Retrying`], sleeping
/// for the scheduled delay in between.
///
/// # Errors
///
/// The first [`DispatchError`] returned by an attempt.
pub async fn drive_attempts<F, Fut>(
    mut envelope: Envelope,
    cancel: CancellationToken,
    mut attempt: F,
) -> Result<DispatchOutcome, DispatchError>
where
    F: FnMut(Envelope, CancellationToken) -> Fut,
    Fut: Future<Output = Result<DispatchOutcome, DispatchError>>,
{
    loop {
        match attempt(envelope, cancel.child_token()).await? {
            DispatchOutcome::Retrying {
                envelope: next,
                delay,
                fault,
            } => {
                if cancel.is_cancelled() {
                    return Ok(DispatchOutcome::Retrying {
                        envelope: next,
                        delay,
                        fault,
                    });
                }
                tokio::select! {
                    () = cancel.cancelled() => {
                        return Ok(DispatchOutcome::Retrying { envelope: next, delay, fault });
                    }
                    () = tokio::time::sleep(delay) => {}
                }
                envelope = next;
            }
            other => return Ok(other),
        }
    }
}

impl Service<Delivery> for OutboxDispatcher {
    type Response = DispatchOutcome;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<DispatchOutcome, DispatchError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, delivery: Delivery) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            this.execute_within(delivery.envelope, &delivery.cancel, delivery.deadline)
                .await
        })
    }
}
