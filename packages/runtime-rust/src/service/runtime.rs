//! The assembled runtime: validated chains, routing, outbox dispatcher, relay
//! task and lifecycle.
//!
//! [`RuntimeBuilder::build`] performs every startup check. A runtime that
//! exists is `Ready`: its chains compiled, its routing table resolves every
//! type a handler publishes, and its outbox binding matches what the chains
//! require.

use std::sync::Arc;

use courier_core::{ClockSource, Envelope, Message};
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tower::util::BoxCloneService;
use tower::ServiceExt;

use crate::chain::{ChainCache, ChainCompiler, HandlerDescriptor, Policy, PolicyRegistry};
use crate::error::{ConfigurationError, DispatchError, RoutingError, StartupError};
use crate::http::EndpointInvoker;
use crate::outbox::{
    drive_attempts, Delivery, DispatchHook, DispatchOutcome, FlushReport, OutboxDispatcher, OutboxRelay, RelayHandle,
};
use crate::routing::{MessageCatalog, RouteConfiguration, RoutingResolver, RoutingTable};
use crate::service::config::RuntimeConfig;
use crate::service::lifecycle::LifecycleController;
use crate::service::middleware::{build_dispatch_pipeline, DispatchService};
use crate::traits::{OutboxStore, TransportEndpoint};

/// Collects registrations; [`RuntimeBuilder::build`] validates them.
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    catalog: MessageCatalog,
    catalog_error: Option<RoutingError>,
    descriptors: Vec<HandlerDescriptor>,
    policies: PolicyRegistry,
    resolver: RoutingResolver,
    store: Option<Arc<dyn OutboxStore>>,
    transport: Option<Arc<dyn TransportEndpoint>>,
    hook: Option<Arc<dyn DispatchHook>>,
    clock: Option<Arc<dyn ClockSource>>,
}

impl RuntimeBuilder {
    fn new(config: RuntimeConfig) -> Self {
        let resolver = RoutingResolver::new(config.naming.clone()).conventional(config.conventional_routing);
        Self {
            config,
            catalog: MessageCatalog::new(),
            catalog_error: None,
            descriptors: Vec::new(),
            policies: PolicyRegistry::with_defaults(),
            resolver,
            store: None,
            transport: None,
            hook: None,
            clock: None,
        }
    }

    /// Register `M` as a known message type.
    #[must_use]
    pub fn message<M: Message>(mut self, publishable: bool) -> Self {
        let result = self.catalog.register_message::<M>(publishable);
        self.keep_first_error(result);
        self
    }

    /// Register `M` under a short alias used for its destination names.
    #[must_use]
    pub fn message_aliased<M: Message>(mut self, alias: &str, publishable: bool) -> Self {
        let result = self.catalog.register_aliased(M::MESSAGE_TYPE, alias, publishable);
        self.keep_first_error(result);
        self
    }

    /// Add a handler. Its message type is marked handled and every type it
    /// publishes is registered as publishable.
    #[must_use]
    pub fn handler(mut self, descriptor: HandlerDescriptor) -> Self {
        let result = self.catalog.mark_handled(descriptor.message_type.as_str());
        self.keep_first_error(result);
        for published in &descriptor.publishes {
            let result = self.catalog.register(published.as_str(), true);
            self.keep_first_error(result);
        }
        self.descriptors.push(descriptor);
        self
    }

    /// Append a middleware policy after the built-in ones.
    #[must_use]
    pub fn policy(mut self, policy: impl Policy + 'static) -> Self {
        self.policies.register(policy);
        self
    }

    #[must_use]
    pub fn outbox_store(mut self, store: Arc<dyn OutboxStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn TransportEndpoint>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Explicit routing for one message type.
    #[must_use]
    pub fn route(mut self, message_type: impl Into<String>, configure: impl FnOnce(&mut RouteConfiguration)) -> Self {
        self.resolver = self.resolver.configure(message_type, configure);
        self
    }

    #[must_use]
    pub fn hook(mut self, hook: Arc<dyn DispatchHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    fn keep_first_error(&mut self, result: Result<(), RoutingError>) {
        if let Err(err) = result {
            self.catalog_error.get_or_insert(err);
        }
    }

    /// Validate everything and start the runtime.
    ///
    /// Must be called from within a Tokio runtime; the outbox relay task is
    /// spawned here.
    ///
    /// # Errors
    ///
    /// The first [`StartupError`]: invalid configuration, a missing transport
    /// or outbox binding, a chain that does not compile, or a routing table
    /// that does not validate.
    pub fn build(self) -> Result<Runtime, StartupError> {
        self.config.validate()?;
        let transport = self.transport.ok_or(ConfigurationError::MissingTransport)?;
        if let Some(err) = self.catalog_error {
            return Err(err.into());
        }

        let compiler = ChainCompiler::new(self.policies).with_outbox_binding(self.store.is_some());
        let compiled = compiler.compile_all(&self.descriptors)?;

        let routing = self.resolver.build(&self.catalog)?;
        for chain in compiled.values() {
            routing.require(chain.publishes().iter().map(|t| t.as_str()))?;
        }
        let routing = Arc::new(routing);

        let chains = Arc::new(ChainCache::new());
        chains.install(compiled);

        let mut dispatcher = OutboxDispatcher::new(Arc::clone(&chains), Arc::clone(&routing), transport)
            .with_retry(self.config.retry.to_policy());
        if let Some(store) = self.store.clone() {
            dispatcher = dispatcher.with_store(store);
        }
        if let Some(hook) = self.hook {
            dispatcher = dispatcher.with_hook(hook);
        }
        if let Some(clock) = self.clock {
            dispatcher = dispatcher.with_clock(clock);
        }

        let lifecycle = LifecycleController::new();
        let pipeline = BoxCloneService::new(build_dispatch_pipeline(
            dispatcher.clone(),
            &self.config,
            lifecycle.state_handle(),
        ));
        let relay = self
            .store
            .is_some()
            .then(|| OutboxRelay::new(dispatcher.clone()).spawn(self.config.relay_interval()));

        lifecycle.set_ready();
        tracing::info!(
            node_id = %self.config.node_id,
            chains = chains.len(),
            destinations = ?routing.destinations(),
            outbox = self.store.is_some(),
            "runtime ready"
        );

        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                config: self.config,
                descriptors: self.descriptors,
                compiler,
                chains,
                routing,
                dispatcher,
                pipeline: parking_lot::Mutex::new(pipeline),
                lifecycle,
                relay: tokio::sync::Mutex::new(relay),
            }),
        })
    }
}

struct RuntimeInner {
    config: RuntimeConfig,
    descriptors: Vec<HandlerDescriptor>,
    compiler: ChainCompiler,
    chains: Arc<ChainCache>,
    routing: Arc<RoutingTable>,
    dispatcher: OutboxDispatcher,
    pipeline: parking_lot::Mutex<DispatchService>,
    lifecycle: LifecycleController,
    relay: tokio::sync::Mutex<Option<RelayHandle>>,
}

/// Handle to a running runtime. Clones share the same state.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    #[must_use]
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn chains(&self) -> &Arc<ChainCache> {
        &self.inner.chains
    }

    #[must_use]
    pub fn routing(&self) -> &RoutingTable {
        &self.inner.routing
    }

    #[must_use]
    pub fn lifecycle(&self) -> &LifecycleController {
        &self.inner.lifecycle
    }

    #[must_use]
    pub fn dispatcher(&self) -> &OutboxDispatcher {
        &self.inner.dispatcher
    }

    fn pipeline(&self) -> DispatchService {
        self.inner.pipeline.lock().clone()
    }

    /// Dispatch `envelope` through the pipeline until it is handled,
    /// dead-lettered or failed, retrying per the configured policy.
    ///
    /// Shutdown cancels the current attempt; the envelope is then returned
    /// as [`DispatchOutcome::Retrying`] for the transport to redeliver.
    ///
    /// # Errors
    ///
    /// [`DispatchError`] when the pipeline rejects the delivery.
    pub async fn deliver(&self, envelope: Envelope) -> Result<DispatchOutcome, DispatchError> {
        let _in_flight = self.inner.lifecycle.in_flight_guard();
        let pipeline = self.pipeline();
        drive_attempts(envelope, self.inner.lifecycle.shutdown_token(), move |envelope, cancel| {
            pipeline
                .clone()
                .oneshot(Delivery::new(envelope).with_cancellation(cancel))
        })
        .await
    }

    /// Run [`Runtime::deliver`] on its own task.
    #[must_use]
    pub fn spawn_dispatch(&self, envelope: Envelope) -> tokio::task::JoinHandle<Result<DispatchOutcome, DispatchError>> {
        let runtime = self.clone();
        tokio::spawn(async move { runtime.deliver(envelope).await })
    }

    /// Receive every envelope currently waiting on the transport and dispatch
    /// them concurrently.
    ///
    /// # Errors
    ///
    /// [`crate::error::TransportFault`] when the transport fails to receive.
    pub async fn poll_inbound(
        &self,
        transport: &dyn TransportEndpoint,
    ) -> Result<Vec<Result<DispatchOutcome, DispatchError>>, crate::error::TransportFault> {
        let mut received = Vec::new();
        while let Some(envelope) = transport.receive().await? {
            received.push(envelope);
        }
        Ok(join_all(received.into_iter().map(|envelope| self.deliver(envelope))).await)
    }

    /// HTTP entry point for the chain handling `message_type`. Requests go
    /// through the same pipeline as transport deliveries and count as in
    /// flight during shutdown.
    #[must_use]
    pub fn invoker(&self, message_type: &str) -> Option<EndpointInvoker> {
        let chain = self.inner.chains.get(message_type)?;
        Some(EndpointInvoker::new(chain, self.pipeline()).with_lifecycle(self.inner.lifecycle.clone()))
    }

    /// Send whatever the outbox still holds as pending.
    pub async fn flush_outbox(&self) -> Option<FlushReport> {
        let relay = self.inner.relay.lock().await;
        relay.as_ref()?.flush_now().await
    }

    /// Recompile every registered handler and swap the chains in atomically.
    ///
    /// # Errors
    ///
    /// Leaves the current chains in place when compilation fails.
    pub fn rebuild_chains(&self) -> Result<usize, StartupError> {
        self.inner
            .chains
            .rebuild(&self.inner.descriptors, &self.inner.compiler)
    }

    /// Stop accepting deliveries, wait for in-flight ones, then stop the relay
    /// after a final flush.
    ///
    /// Returns `false` when in-flight deliveries did not drain in time.
    pub async fn shutdown(&self) -> bool {
        tracing::info!("runtime shutting down");
        self.inner.lifecycle.begin_shutdown();
        let drained = self
            .inner
            .lifecycle
            .wait_for_drain(self.inner.config.drain_timeout())
            .await;
        if !drained {
            tracing::warn!(
                in_flight = self.inner.lifecycle.in_flight_count(),
                "in-flight deliveries did not drain"
            );
        }
        if let Some(mut relay) = self.inner.relay.lock().await.take() {
            relay.stop().await;
        }
        drained
    }

    /// Token cancelled when shutdown begins.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.lifecycle.shutdown_token()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use courier_core::{EnvelopeStatus, TypeRef};
    use http::{Method, Request, StatusCode};
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};

    use super::*;
    use crate::chain::testing::{descriptor, NoopHandler};
    use crate::chain::{Annotation, GroupDescriptor, Handler, HandlerContext, Parameter, ReturnType};
    use crate::error::CompilationError;
    use crate::outbox::{DispatchState, InMemoryOutboxStore, RecordingDispatchHook};
    use crate::routing::NamingConfig;
    use crate::service::config::RetryConfig;
    use crate::service::lifecycle::LifecycleState;
    use crate::transport::InMemoryTransport;

    #[derive(Debug, Serialize, Deserialize)]
    struct CreateTodo {
        title: String,
    }

    impl Message for CreateTodo {
        const MESSAGE_TYPE: &'static str = "todos::CreateTodo";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct TodoCreated {
        title: String,
    }

    impl Message for TodoCreated {
        const MESSAGE_TYPE: &'static str = "todos::TodoCreated";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Routed;

    impl Message for Routed {
        const MESSAGE_TYPE: &'static str = "Routed";
    }

    /// Stages the todo, publishes `TodoCreated`, and fails the first
    /// `failures` calls after publishing.
    struct CreateTodoHandler {
        failures: AtomicU32,
        calls: Arc<AtomicU32>,
    }

    impl CreateTodoHandler {
        fn failing(failures: u32) -> (Self, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (
                Self {
                    failures: AtomicU32::new(failures),
                    calls: Arc::clone(&calls),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl Handler for CreateTodoHandler {
        async fn handle(&self, ctx: &mut HandlerContext<'_>) -> anyhow::Result<Option<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let todo: CreateTodo = ctx.message()?;
            ctx.stage(&format!("todos/{}", todo.title), json!({"title": todo.title}));
            ctx.bus()?.publish(&TodoCreated {
                title: todo.title.clone(),
            })?;
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("database unavailable");
            }
            Ok(Some(json!({"title": todo.title})))
        }
    }

    /// Outlives any dispatch timeout used in these tests.
    struct SlowHandler;

    #[async_trait]
    impl Handler for SlowHandler {
        async fn handle(&self, _ctx: &mut HandlerContext<'_>) -> anyhow::Result<Option<Value>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }
    }

    fn create_todo(handler: CreateTodoHandler) -> HandlerDescriptor {
        HandlerDescriptor::new(
            &GroupDescriptor::new("Todos"),
            "create",
            TypeRef::of::<CreateTodo>(),
            handler,
        )
        .with_parameter(Parameter::Body(TypeRef::of::<CreateTodo>()))
        .with_parameter(Parameter::MessageBus)
        .returning(ReturnType::task(ReturnType::Value(TypeRef::from_static("todos::Todo"))))
        .annotated(Annotation::route(Method::POST, "/todos"))
        .publishing(TypeRef::of::<TodoCreated>())
    }

    fn fast_config(max_attempts: u32) -> RuntimeConfig {
        RuntimeConfig {
            retry: RetryConfig {
                max_attempts,
                base_delay_ms: 1,
                ..RetryConfig::default()
            },
            ..RuntimeConfig::default()
        }
    }

    struct Fixture {
        runtime: Runtime,
        store: InMemoryOutboxStore,
        transport: InMemoryTransport,
        hook: Arc<RecordingDispatchHook>,
    }

    fn fixture(config: RuntimeConfig, handler: CreateTodoHandler) -> Fixture {
        fixture_with(config, handler, Vec::<HandlerDescriptor>::new())
    }

    fn fixture_with(
        config: RuntimeConfig,
        handler: CreateTodoHandler,
        extra: impl IntoIterator<Item = HandlerDescriptor>,
    ) -> Fixture {
        let store = InMemoryOutboxStore::new();
        let transport = InMemoryTransport::new();
        let hook = Arc::new(RecordingDispatchHook::new());
        let mut builder = Runtime::builder(config)
            .message::<CreateTodo>(false)
            .message::<TodoCreated>(true)
            .handler(create_todo(handler));
        for descriptor in extra {
            builder = builder.handler(descriptor);
        }
        let runtime = builder
            .route(TodoCreated::MESSAGE_TYPE, |r| {
                r.destination("todos.created");
            })
            .outbox_store(Arc::new(store.clone()))
            .transport(Arc::new(transport.clone()))
            .hook(hook.clone())
            .build()
            .unwrap();
        Fixture {
            runtime,
            store,
            transport,
            hook,
        }
    }

    fn todo(title: &str) -> Envelope {
        Envelope::new(&CreateTodo { title: title.into() }).unwrap()
    }

    #[tokio::test]
    async fn endpoint_metadata_describes_json_body_and_resource() {
        let (handler, _) = CreateTodoHandler::failing(0);
        let f = fixture(RuntimeConfig::default(), handler);

        let chain = f.runtime.chains().get(CreateTodo::MESSAGE_TYPE).unwrap();
        let metadata = chain.metadata();
        let accepts = metadata.accepts.as_ref().unwrap();
        assert_eq!(accepts.request_type, TypeRef::of::<CreateTodo>());
        assert_eq!(accepts.content_types, vec!["application/json".to_string()]);

        let ok = metadata.produces_for(200).unwrap();
        assert_eq!(ok.body, Some(TypeRef::from_static("todos::Todo")));
        assert_eq!(ok.content_types, vec!["application/json".to_string()]);
        assert_eq!(metadata.produces_for(400).unwrap().body, None);
        assert_eq!(metadata.produces_for(404).unwrap().body, None);
        assert!(chain.requires_outbox());
    }

    #[tokio::test]
    async fn retried_delivery_sends_once_after_success() {
        let (handler, calls) = CreateTodoHandler::failing(1);
        let f = fixture(fast_config(3), handler);

        let envelope = todo("milk");
        let id = envelope.id();
        let outcome = f.runtime.deliver(envelope).await.unwrap();

        assert!(matches!(outcome, DispatchOutcome::Handled { .. }));
        assert_eq!(outcome.envelope().status(), EnvelopeStatus::Handled);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            f.hook.states_for(id),
            vec![
                DispatchState::Received,
                DispatchState::Executing,
                DispatchState::Retrying,
                DispatchState::Received,
                DispatchState::Executing,
                DispatchState::Committed,
                DispatchState::Sent,
            ]
        );
        let sent = f.transport.drain("todos.created");
        assert_eq!(sent.len(), 1);
        assert_eq!(f.transport.sent_count(), 1);
        assert_eq!(f.store.rollbacks(), 1);
        assert_eq!(f.store.commits(), 1);
        assert_eq!(f.store.state("todos/milk"), Some(json!({"title": "milk"})));
    }

    #[tokio::test]
    async fn exhausted_delivery_is_dead_lettered_without_outgoing_sends() {
        let (handler, calls) = CreateTodoHandler::failing(u32::MAX);
        let f = fixture(fast_config(2), handler);

        let outcome = f.runtime.deliver(todo("eggs")).await.unwrap();

        assert!(matches!(outcome, DispatchOutcome::DeadLettered { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(f.transport.drain("todos.created").is_empty());
        let dead = f.transport.drain("todos::CreateTodo.dead-letter");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].status(), EnvelopeStatus::DeadLettered);
        assert_eq!(f.store.state("todos/eggs"), None);
        assert_eq!(f.store.pending_count(), 0);
    }

    #[tokio::test]
    async fn equivalent_deliveries_publish_equivalent_envelopes() {
        let (handler, _) = CreateTodoHandler::failing(0);
        let f = fixture(RuntimeConfig::default(), handler);

        f.runtime.deliver(todo("bread")).await.unwrap();
        f.runtime.deliver(todo("bread")).await.unwrap();

        let shapes: Vec<(String, Value, Option<String>)> = f
            .transport
            .drain("todos.created")
            .into_iter()
            .map(|e| {
                (
                    e.message_type().to_string(),
                    e.payload().clone(),
                    e.destination().map(str::to_string),
                )
            })
            .collect();
        assert_eq!(shapes.len(), 2);
        assert_eq!(shapes[0], shapes[1]);
    }

    #[tokio::test]
    async fn conventional_destinations_follow_the_prefix() {
        let transport = InMemoryTransport::new();
        let runtime = Runtime::builder(RuntimeConfig {
            naming: NamingConfig::default().with_prefix("zztop"),
            ..RuntimeConfig::default()
        })
        .message::<Routed>(true)
        .handler(HandlerDescriptor::new(
            &GroupDescriptor::new("Routing"),
            "routed",
            TypeRef::of::<Routed>(),
            NoopHandler,
        ))
        .transport(Arc::new(transport))
        .build()
        .unwrap();

        let rule = runtime.routing().resolve("Routed").unwrap();
        assert_eq!(rule.destination, "zztop.Routed");
        assert_eq!(rule.dead_letter.as_deref(), Some("zztop.Routed.dead-letter"));
        assert_eq!(runtime.routing().destinations(), vec!["zztop.Routed"]);
    }

    #[tokio::test]
    async fn bus_handler_without_outbox_store_fails_startup() {
        let (handler, _) = CreateTodoHandler::failing(0);
        let err = Runtime::builder(RuntimeConfig::default())
            .handler(create_todo(handler))
            .route(TodoCreated::MESSAGE_TYPE, |r| {
                r.destination("todos.created");
            })
            .transport(Arc::new(InMemoryTransport::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            StartupError::Configuration(ConfigurationError::MissingOutboxBinding { .. })
        ));
    }

    #[tokio::test]
    async fn unrouted_published_type_fails_startup() {
        let (handler, _) = CreateTodoHandler::failing(0);
        let err = Runtime::builder(RuntimeConfig::default())
            .handler(create_todo(handler))
            .outbox_store(Arc::new(InMemoryOutboxStore::new()))
            .transport(Arc::new(InMemoryTransport::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            StartupError::Routing(RoutingError::Unrouted { ref message_type }) if message_type == TodoCreated::MESSAGE_TYPE
        ));
    }

    #[tokio::test]
    async fn explicit_route_for_unknown_type_fails_startup() {
        let err = Runtime::builder(RuntimeConfig::default())
            .route("app::Ghost", |r| {
                r.destination("ghosts");
            })
            .transport(Arc::new(InMemoryTransport::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            StartupError::Routing(RoutingError::UnknownMessageType { .. })
        ));
    }

    #[tokio::test]
    async fn missing_transport_and_duplicate_handlers_fail_startup() {
        let err = Runtime::builder(RuntimeConfig::default()).build().err().unwrap();
        assert!(matches!(
            err,
            StartupError::Configuration(ConfigurationError::MissingTransport)
        ));

        let err = Runtime::builder(RuntimeConfig::default())
            .handler(descriptor("A", "ping"))
            .handler(descriptor("B", "ping"))
            .transport(Arc::new(InMemoryTransport::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            StartupError::Compilation(CompilationError::DuplicateHandler { .. })
        ));
    }

    #[tokio::test]
    async fn alias_collision_fails_startup() {
        let err = Runtime::builder(RuntimeConfig::default())
            .message_aliased::<CreateTodo>("Todo", false)
            .message_aliased::<TodoCreated>("Todo", true)
            .transport(Arc::new(InMemoryTransport::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, StartupError::Routing(RoutingError::Collision { .. })));
    }

    #[tokio::test]
    async fn shutdown_closes_the_pipeline() {
        let (handler, _) = CreateTodoHandler::failing(0);
        let f = fixture(RuntimeConfig::default(), handler);
        assert_eq!(f.runtime.lifecycle().state(), LifecycleState::Ready);

        assert!(f.runtime.shutdown().await);
        assert_eq!(f.runtime.lifecycle().state(), LifecycleState::Stopped);

        let err = f.runtime.deliver(todo("late")).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotAccepting { .. }));
    }

    #[tokio::test]
    async fn shutdown_interrupts_pending_retries() {
        let (handler, _) = CreateTodoHandler::failing(u32::MAX);
        let mut config = fast_config(10);
        config.retry.base_delay_ms = 60_000;
        let f = fixture(config, handler);

        let pending = f.runtime.spawn_dispatch(todo("slow"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        f.runtime.shutdown_token().cancel();

        let outcome = pending.await.unwrap().unwrap();
        assert!(matches!(outcome, DispatchOutcome::Retrying { .. }));
        assert_eq!(outcome.envelope().attempts(), 1);
    }

    #[tokio::test]
    async fn inbound_envelopes_are_dispatched_concurrently() {
        let (handler, calls) = CreateTodoHandler::failing(0);
        let f = fixture(RuntimeConfig::default(), handler);
        for title in ["a", "b", "c"] {
            f.transport.inject(todo(title));
        }

        let results = f.runtime.poll_inbound(&f.transport).await.unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.as_ref().is_ok_and(DispatchOutcome::is_handled)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let titles: BTreeSet<String> = f
            .transport
            .drain("todos.created")
            .iter()
            .map(|e| e.payload()["title"].to_string())
            .collect();
        assert_eq!(titles.len(), 3);
    }

    #[tokio::test]
    async fn relay_flushes_sends_left_pending() {
        let (handler, _) = CreateTodoHandler::failing(0);
        let mut config = fast_config(1);
        config.naming = NamingConfig::default().without_dead_letters();
        let f = fixture(config, handler);

        f.transport.make_unreachable("todos.created");
        let outcome = f.runtime.deliver(todo("jam")).await.unwrap();
        match outcome {
            DispatchOutcome::Handled { flush, .. } => assert_eq!(flush.deferred, 1),
            other => panic!("expected handled, got {other:?}"),
        }
        assert_eq!(f.store.pending_count(), 1);

        f.transport.restore("todos.created");
        let report = f.runtime.flush_outbox().await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(f.store.pending_count(), 0);
        assert_eq!(f.transport.drain("todos.created").len(), 1);
    }

    #[tokio::test]
    async fn invoker_answers_http_requests() {
        let (handler, _) = CreateTodoHandler::failing(0);
        let f = fixture(RuntimeConfig::default(), handler);
        let invoker = f.runtime.invoker(CreateTodo::MESSAGE_TYPE).unwrap();

        let request = Request::builder()
            .method(Method::POST)
            .uri("/todos")
            .body(Bytes::from_static(br#"{"title":"tea"}"#))
            .unwrap();
        let response = invoker.invoke(request, None, &CancellationToken::new()).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body, json!({"title": "tea"}));
        assert_eq!(f.transport.drain("todos.created").len(), 1);
        assert!(f.runtime.invoker("todos::Unknown").is_none());
    }

    #[tokio::test]
    async fn invoker_refuses_requests_after_shutdown() {
        let (handler, calls) = CreateTodoHandler::failing(0);
        let f = fixture(RuntimeConfig::default(), handler);
        let invoker = f.runtime.invoker(CreateTodo::MESSAGE_TYPE).unwrap();
        assert!(f.runtime.shutdown().await);

        let request = Request::builder()
            .method(Method::POST)
            .uri("/todos")
            .body(Bytes::from_static(br#"{"title":"late"}"#))
            .unwrap();
        let response = invoker.invoke(request, None, &CancellationToken::new()).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.transport.sent_count(), 0);
        assert_eq!(f.runtime.lifecycle().in_flight_count(), 0);
    }

    #[tokio::test]
    async fn invoker_requests_are_bounded_by_the_dispatch_timeout() {
        let (handler, _) = CreateTodoHandler::failing(0);
        let config = RuntimeConfig {
            dispatch_timeout_ms: 20,
            ..RuntimeConfig::default()
        };
        let slow = descriptor("Tools", "slow")
            .with_handler(SlowHandler)
            .annotated(Annotation::route(Method::GET, "/slow"));
        let f = fixture_with(config, handler, [slow]);
        let invoker = f.runtime.invoker("app::slow").unwrap();

        let request = Request::builder()
            .method(Method::GET)
            .uri("/slow")
            .body(Bytes::new())
            .unwrap();
        let response = invoker.invoke(request, None, &CancellationToken::new()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn rebuild_recompiles_registered_handlers() {
        let (handler, _) = CreateTodoHandler::failing(0);
        let f = fixture(RuntimeConfig::default(), handler);
        let before = f.runtime.chains().get(CreateTodo::MESSAGE_TYPE).unwrap();

        assert_eq!(f.runtime.rebuild_chains().unwrap(), 1);
        let after = f.runtime.chains().get(CreateTodo::MESSAGE_TYPE).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(before.step_names(), after.step_names());
    }
}
