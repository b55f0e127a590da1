//! Pipeline composition: combines all middleware layers into a single service stack.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tower::util::BoxCloneService;
use tower::ServiceBuilder;

use super::gate::LifecycleGateLayer;
use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::error::DispatchError;
use crate::outbox::{Delivery, DispatchOutcome, OutboxDispatcher};
use crate::service::config::RuntimeConfig;
use crate::service::lifecycle::LifecycleState;

/// Type-erased pipeline shared by the runtime and its HTTP invokers.
pub type DispatchService = BoxCloneService<Delivery, DispatchOutcome, DispatchError>;

/// Build the dispatch pipeline by wrapping the `OutboxDispatcher` with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `LifecycleGateLayer` -- reject before startup completes and while draining
/// 2. `LoadShedLayer` -- reject when overloaded
/// 3. `MetricsLayer` -- record timing and outcome
/// 4. `TimeoutLayer` -- stamp the per-attempt deadline
///
/// Each call runs exactly one attempt.
#[must_use]
pub fn build_dispatch_pipeline(
    dispatcher: OutboxDispatcher,
    config: &RuntimeConfig,
    state: Arc<ArcSwap<LifecycleState>>,
) -> impl tower::Service<
    Delivery,
    Response = DispatchOutcome,
    Error = DispatchError,
    Future = impl Send + 'static,
> + Clone
       + Send
       + 'static {
    ServiceBuilder::new()
        .layer(LifecycleGateLayer::new(state))
        .layer(LoadShedLayer::new(config.max_concurrent_dispatches))
        .layer(MetricsLayer)
        .layer(TimeoutLayer::new(config.dispatch_timeout()))
        .service(dispatcher)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use courier_core::Envelope;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::chain::testing::descriptor;
    use crate::chain::{ChainCache, ChainCompiler, Handler, HandlerContext, PolicyRegistry};
    use crate::outbox::RetryPolicy;
    use crate::routing::{MessageCatalog, NamingConfig, RoutingResolver};
    use crate::service::lifecycle::LifecycleController;
    use crate::transport::InMemoryTransport;

    struct Sleepy;

    #[async_trait]
    impl Handler for Sleepy {
        async fn handle(&self, _ctx: &mut HandlerContext<'_>) -> anyhow::Result<Option<serde_json::Value>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }
    }

    fn dispatcher() -> OutboxDispatcher {
        let chains = Arc::new(ChainCache::new());
        let echo = descriptor("Tools", "echo");
        let sleepy = descriptor("Tools", "sleepy").with_handler(Sleepy);
        chains.install(
            ChainCompiler::new(PolicyRegistry::new())
                .compile_all([&echo, &sleepy])
                .unwrap(),
        );
        let routing = RoutingResolver::new(NamingConfig::default())
            .build(&MessageCatalog::new())
            .unwrap();
        OutboxDispatcher::new(chains, Arc::new(routing), Arc::new(InMemoryTransport::new()))
            .with_retry(RetryPolicy::fixed(3, Duration::from_millis(10)))
    }

    #[tokio::test]
    async fn pipeline_dispatches_once_ready() {
        let lifecycle = LifecycleController::new();
        let config = RuntimeConfig::default();
        let svc = build_dispatch_pipeline(dispatcher(), &config, lifecycle.state_handle());

        let delivery = Delivery::new(Envelope::from_parts("app::echo", json!({"n": 1})));
        let err = svc.clone().oneshot(delivery.clone()).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotAccepting { .. }));

        lifecycle.set_ready();
        let outcome = svc.oneshot(delivery).await.unwrap();
        assert!(outcome.is_handled());
    }

    #[tokio::test]
    async fn deadline_expiry_is_a_retryable_fault() {
        let lifecycle = LifecycleController::new();
        lifecycle.set_ready();
        let config = RuntimeConfig {
            dispatch_timeout_ms: 20,
            ..RuntimeConfig::default()
        };
        let svc = build_dispatch_pipeline(dispatcher(), &config, lifecycle.state_handle());

        let outcome = svc
            .oneshot(Delivery::new(Envelope::from_parts("app::sleepy", json!({}))))
            .await
            .unwrap();
        match outcome {
            DispatchOutcome::Retrying { envelope, fault, .. } => {
                assert_eq!(envelope.attempts(), 1);
                assert!(fault.contains("timed out"));
            }
            other => panic!("expected a retry, got {other:?}"),
        }
    }
}
