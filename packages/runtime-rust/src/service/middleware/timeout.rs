//! Per-attempt deadline for deliveries.
//!
//! Unlike a plain `tokio::time::timeout`, the deadline is handed to the
//! dispatcher so that an expired attempt still rolls back its unit of work
//! and is retried as an ordinary fault.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tower::{Layer, Service};

use crate::error::DispatchError;
use crate::outbox::{Delivery, DispatchOutcome};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that stamps a default deadline on deliveries without one.
#[derive(Debug, Clone)]
pub struct TimeoutLayer {
    deadline: Duration,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            deadline: self.deadline,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    deadline: Duration,
}

impl<S> Service<Delivery> for TimeoutService<S>
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

    fn call(&mut self, mut delivery: Delivery) -> Self::Future {
        if delivery.deadline.is_none() {
            delivery.deadline = Some(self.deadline);
        }
        Box::pin(self.inner.call(delivery))
    }
}
