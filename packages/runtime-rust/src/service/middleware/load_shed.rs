//! Concurrency limit for deliveries.
//!
//! At most `max_concurrent_dispatches` attempts run at once. A delivery that
//! finds no free permit is refused on the spot with
//! [`DispatchError::Overloaded`], carrying its envelope back untouched, so the
//! transport redelivers it later instead of queueing it in memory.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::Semaphore;
use tower::{Layer, Service};

use crate::error::DispatchError;
use crate::outbox::{Delivery, DispatchOutcome};

/// Shares one permit pool across every service it wraps, so clones of the
/// pipeline count against the same limit.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    permits: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent_dispatches: u32) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent_dispatches as usize)),
        }
    }

    /// Permits not currently held by a running attempt.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            permits: Arc::clone(&self.permits),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    permits: Arc<Semaphore>,
}

impl<S> LoadShedService<S> {
    fn shed(delivery: Delivery) -> DispatchError {
        let envelope = delivery.envelope;
        metrics::counter!(
            "courier_deliveries_shed_total",
            "message_type" => envelope.message_type().to_string()
        )
        .increment(1);
        tracing::debug!(envelope_id = %envelope.id(), attempts = envelope.attempts(), "delivery shed");
        DispatchError::Overloaded {
            envelope: Box::new(envelope),
        }
    }
}

impl<S> Service<Delivery> for LoadShedService<S>
where
    S: Service<Delivery, Response = DispatchOutcome, Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = DispatchOutcome;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<DispatchOutcome, DispatchError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, delivery: Delivery) -> Self::Future {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            let err = Self::shed(delivery);
            return Box::pin(async move { Err(err) });
        };

        let attempt = self.inner.call(delivery);
        Box::pin(async move {
            let outcome = attempt.await;
            drop(permit);
            outcome
        })
    }
}
