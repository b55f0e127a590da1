//! Metrics middleware for deliveries.
//!
//! Wraps each attempt in a `delivery` span and records its duration in the
//! `courier_dispatch_duration_seconds` histogram, labelled by outcome.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::error::DispatchError;
use crate::outbox::{Delivery, DispatchOutcome};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Delivery> for MetricsService<S>
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
        let message_type = delivery.envelope.message_type().to_string();
        let span = info_span!(
            "delivery",
            envelope_id = %delivery.envelope.id(),
            message_type = %message_type,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(delivery);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(outcome) => outcome.label(),
                    Err(_) => "rejected",
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);
                metrics::histogram!(
                    "courier_dispatch_duration_seconds",
                    "message_type" => message_type,
                    "outcome" => outcome
                )
                .record(elapsed.as_secs_f64());

                tracing::debug!(duration_ms, outcome, "delivery complete");
                result
            }
            .instrument(span),
        )
    }
}
