//! Lifecycle gate: deliveries are only dispatched while the runtime is ready.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use arc_swap::ArcSwap;
use tower::{Layer, Service};

use crate::error::DispatchError;
use crate::outbox::{Delivery, DispatchOutcome};
use crate::service::lifecycle::LifecycleState;

#[derive(Debug, Clone)]
pub struct LifecycleGateLayer {
    state: Arc<ArcSwap<LifecycleState>>,
}

impl LifecycleGateLayer {
    #[must_use]
    pub fn new(state: Arc<ArcSwap<LifecycleState>>) -> Self {
        Self { state }
    }
}

impl<S> Layer<S> for LifecycleGateLayer {
    type Service = LifecycleGateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LifecycleGateService {
            inner,
            state: Arc::clone(&self.state),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleGateService<S> {
    inner: S,
    state: Arc<ArcSwap<LifecycleState>>,
}

impl<S> Service<Delivery> for LifecycleGateService<S>
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
        let state = **self.state.load();
        if state != LifecycleState::Ready {
            tracing::debug!(envelope_id = %delivery.envelope.id(), ?state, "delivery refused by lifecycle gate");
            let envelope = Box::new(delivery.envelope);
            return Box::pin(async move { Err(DispatchError::NotAccepting { envelope }) });
        }
        Box::pin(self.inner.call(delivery))
    }
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;
    use crate::service::lifecycle::LifecycleController;
    use crate::service::middleware::testing::{delivery, StubDispatch};

    #[tokio::test]
    async fn rejects_until_ready_and_after_shutdown() {
        let lifecycle = LifecycleController::new();
        let layer = LifecycleGateLayer::new(lifecycle.state_handle());

        let err = layer.layer(StubDispatch::default()).oneshot(delivery()).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotAccepting { .. }));

        lifecycle.set_ready();
        assert!(layer.layer(StubDispatch::default()).oneshot(delivery()).await.is_ok());

        lifecycle.begin_shutdown();
        let refused = delivery();
        let id = refused.envelope.id();
        let err = layer.layer(StubDispatch::default()).oneshot(refused).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotAccepting { .. }));
        assert_eq!(err.into_envelope().map(|e| e.id()), Some(id));
    }
}
