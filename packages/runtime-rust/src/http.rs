//! Externally-triggered chains: bind an HTTP request, run one attempt, write
//! the response.
//!
//! The runtime does not own a server. A host framework hands each request to
//! an [`EndpointInvoker`] as `http::Request<Bytes>` and gets an
//! `http::Response<Bytes>` back.

use std::sync::Arc;

use bytes::Bytes;
use courier_core::{CallerIdentity, Envelope};
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Request, Response, StatusCode};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::chain::{Chain, ChainOutcome};
use crate::error::DispatchError;
use crate::outbox::{Delivery, DispatchOutcome};
use crate::service::lifecycle::LifecycleController;
use crate::service::middleware::DispatchService;

/// Header prefix under which bound route values travel on the envelope.
pub const ROUTE_HEADER_PREFIX: &str = "route.";

/// Result of binding a raw request.
#[derive(Debug)]
pub enum BindResult {
    /// Continue with this envelope.
    Continue(Envelope),
    /// Answer immediately; the chain does not run.
    Stop(Response<Bytes>),
}

/// Turns a raw request into the envelope a chain consumes.
pub trait RequestBinder: Send + Sync {
    fn bind(&self, request: &Request<Bytes>, chain: &Chain) -> BindResult;
}

/// Serializes a chain result onto the response.
pub trait ResponseWriter: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when `body` cannot be serialized.
    fn write(&self, response: &mut Response<Bytes>, status: StatusCode, body: &Value) -> Result<(), serde_json::Error>;
}

/// Binds JSON bodies and `{name}` route segments.
///
/// - the request method and path must match the chain's route, else `405`/`404`
/// - a declared body must parse as JSON, else `400`
/// - a content type outside the accepted set is `415`
/// - route values are copied into the payload object and into
///   `route.{name}` headers
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRequestBinder;

impl RequestBinder for JsonRequestBinder {
    fn bind(&self, request: &Request<Bytes>, chain: &Chain) -> BindResult {
        let metadata = chain.metadata();

        let mut route_values = Vec::new();
        if let Some(route) = &metadata.route {
            if request.method() != route.method {
                return BindResult::Stop(problem(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
            }
            match match_route(&route.pattern, request.uri().path()) {
                Some(values) => route_values = values,
                None => return BindResult::Stop(problem(StatusCode::NOT_FOUND, "no such route")),
            }
        }

        let mut payload = match &metadata.accepts {
            Some(accepts) => {
                if let Some(content_type) = request.headers().get(CONTENT_TYPE) {
                    let content_type = content_type.to_str().unwrap_or_default();
                    let media_type = content_type.split(';').next().unwrap_or_default().trim();
                    if !accepts
                        .content_types
                        .iter()
                        .any(|accepted| accepted.eq_ignore_ascii_case(media_type))
                    {
                        return BindResult::Stop(problem(
                            StatusCode::UNSUPPORTED_MEDIA_TYPE,
                            &format!("unsupported content type {media_type}"),
                        ));
                    }
                }
                match serde_json::from_slice::<Value>(request.body()) {
                    Ok(value) => value,
                    Err(err) => {
                        return BindResult::Stop(problem(
                            StatusCode::BAD_REQUEST,
                            &format!("invalid request body: {err}"),
                        ));
                    }
                }
            }
            None => Value::Object(serde_json::Map::new()),
        };

        if let Value::Object(fields) = &mut payload {
            for (name, value) in &route_values {
                fields
                    .entry(name.clone())
                    .or_insert_with(|| Value::String(value.clone()));
            }
        }

        let mut envelope = Envelope::from_parts(chain.message_type().as_str(), payload);
        for (name, value) in route_values {
            envelope = envelope.with_header(format!("{ROUTE_HEADER_PREFIX}{name}"), value);
        }
        BindResult::Continue(envelope)
    }
}

/// Writes `application/json` bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonResponseWriter;

impl ResponseWriter for JsonResponseWriter {
    fn write(&self, response: &mut Response<Bytes>, status: StatusCode, body: &Value) -> Result<(), serde_json::Error> {
        let bytes = serde_json::to_vec(body)?;
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(courier_core::JSON_CONTENT_TYPE));
        *response.body_mut() = Bytes::from(bytes);
        Ok(())
    }
}

/// Runs one chain for HTTP requests.
///
/// Each request is a single attempt through the dispatch pipeline, so the
/// lifecycle gate, load shedding and the dispatch deadline apply as they do
/// to transport deliveries. A fault answers `500` and is not retried; a
/// refused delivery answers `503`.
#[derive(Clone)]
pub struct EndpointInvoker {
    chain: Arc<Chain>,
    service: Arc<Mutex<DispatchService>>,
    lifecycle: Option<LifecycleController>,
    binder: Arc<dyn RequestBinder>,
    writer: Arc<dyn ResponseWriter>,
}

impl EndpointInvoker {
    #[must_use]
    pub fn new(chain: Arc<Chain>, service: DispatchService) -> Self {
        Self {
            chain,
            service: Arc::new(Mutex::new(service)),
            lifecycle: None,
            binder: Arc::new(JsonRequestBinder),
            writer: Arc::new(JsonResponseWriter),
        }
    }

    /// Count every request as in flight on `lifecycle`, so shutdown waits
    /// for it to finish.
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: LifecycleController) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    #[must_use]
    pub fn with_binder(mut self, binder: Arc<dyn RequestBinder>) -> Self {
        self.binder = binder;
        self
    }

    #[must_use]
    pub fn with_writer(mut self, writer: Arc<dyn ResponseWriter>) -> Self {
        self.writer = writer;
        self
    }

    #[must_use]
    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Bind, execute and answer one request.
    #[tracing::instrument(skip_all, fields(chain = %self.chain.message_type(), method = %request.method(), path = request.uri().path()))]
    pub async fn invoke(
        &self,
        request: Request<Bytes>,
        caller: Option<CallerIdentity>,
        cancel: &CancellationToken,
    ) -> Response<Bytes> {
        let mut envelope = match self.binder.bind(&request, &self.chain) {
            BindResult::Continue(envelope) => envelope,
            BindResult::Stop(response) => return response,
        };
        if let Some(caller) = caller {
            envelope = envelope.with_caller(caller);
        }

        let _in_flight = self.lifecycle.as_ref().map(LifecycleController::in_flight_guard);
        let service = self.service.lock().clone();
        let delivery = Delivery::new(envelope).with_cancellation(cancel.clone());
        match service.oneshot(delivery).await {
            Ok(outcome) => self.answer(outcome),
            Err(err) => {
                tracing::warn!(error = %err, "request rejected");
                let status = match err {
                    DispatchError::Overloaded { .. } | DispatchError::NotAccepting { .. } => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    DispatchError::UnknownChain { .. }
                    | DispatchError::Envelope(_)
                    | DispatchError::DeadLetterUndeliverable { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                };
                problem(status, &err.to_string())
            }
        }
    }

    fn answer(&self, outcome: DispatchOutcome) -> Response<Bytes> {
        match outcome {
            DispatchOutcome::Handled {
                result: ChainOutcome::Completed { result },
                reply,
                ..
            } => {
                let status = reply
                    .status
                    .unwrap_or_else(|| status_or_500(self.chain.metadata().success_status()));
                match result {
                    Some(resource) => self.write(status, &resource),
                    None => empty(StatusCode::NO_CONTENT),
                }
            }
            DispatchOutcome::Handled {
                result: ChainOutcome::Stopped { step },
                reply,
                ..
            } => {
                let status = reply.status.unwrap_or(StatusCode::BAD_REQUEST);
                tracing::debug!(step = %step, status = status.as_u16(), "request stopped by middleware");
                match reply.body {
                    Some(body) => self.write(status, &body),
                    None => empty(status),
                }
            }
            DispatchOutcome::Duplicate { .. } => empty(StatusCode::NO_CONTENT),
            DispatchOutcome::Retrying { fault, .. }
            | DispatchOutcome::DeadLettered { fault, .. }
            | DispatchOutcome::Failed { fault, .. } => {
                tracing::error!(fault = %fault, "handler fault");
                problem(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }

    fn write(&self, status: StatusCode, body: &Value) -> Response<Bytes> {
        let mut response = Response::new(Bytes::new());
        match self.writer.write(&mut response, status, body) {
            Ok(()) => response,
            Err(err) => {
                tracing::error!(error = %err, "response serialization failed");
                problem(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

/// Match `path` against a route pattern, returning the bound `{name}` values.
///
/// Segments of the form `{name}` or `{name:constraint}` match any non-empty
/// segment; constraints are not checked here.
#[must_use]
pub fn match_route(pattern: &str, path: &str) -> Option<Vec<(String, String)>> {
    let pattern_segments: Vec<&str> = pattern.trim_matches('/').split('/').collect();
    let path_segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    if pattern_segments.len() != path_segments.len() {
        return None;
    }

    let mut values = Vec::new();
    for (expected, actual) in pattern_segments.iter().zip(&path_segments) {
        if let Some(inner) = expected.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            if actual.is_empty() {
                return None;
            }
            let name = inner.split(':').next().unwrap_or(inner);
            values.push((name.to_string(), (*actual).to_string()));
        } else if !expected.eq_ignore_ascii_case(actual) {
            return None;
        }
    }
    Some(values)
}

fn status_or_500(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn empty(status: StatusCode) -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = status;
    response
}

fn problem(status: StatusCode, detail: &str) -> Response<Bytes> {
    let body = json!({ "status": status.as_u16(), "detail": detail });
    let mut response = empty(status);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(courier_core::JSON_CONTENT_TYPE));
    *response.body_mut() = Bytes::from(body.to_string());
    response
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use courier_core::TypeRef;
    use http::Method;

    use tower::util::BoxCloneService;
    use tower::Layer;

    use super::*;
    use crate::chain::testing::descriptor;
    use crate::chain::{
        Annotation, ChainCache, ChainCompiler, Handler, HandlerContext, Parameter, PolicyRegistry, ReturnType,
    };
    use crate::outbox::OutboxDispatcher;
    use crate::routing::{MessageCatalog, NamingConfig, RoutingResolver};
    use crate::service::middleware::LoadShedLayer;
    use crate::transport::InMemoryTransport;

    /// Returns `{"id": <route id>, "title": <body title>}`.
    struct GetTodo;

    #[async_trait]
    impl Handler for GetTodo {
        async fn handle(&self, ctx: &mut HandlerContext<'_>) -> anyhow::Result<Option<Value>> {
            let payload = ctx.envelope().payload();
            if payload["id"] == "missing" {
                anyhow::bail!("todo not found");
            }
            Ok(Some(json!({ "id": payload["id"], "title": payload["title"] })))
        }
    }

    fn invoker(descriptor: crate::chain::HandlerDescriptor) -> EndpointInvoker {
        let (chain, dispatcher) = compiled(&descriptor);
        EndpointInvoker::new(chain, BoxCloneService::new(dispatcher))
    }

    fn compiled(descriptor: &crate::chain::HandlerDescriptor) -> (Arc<Chain>, OutboxDispatcher) {
        let chains = Arc::new(ChainCache::new());
        let compiled = ChainCompiler::new(PolicyRegistry::with_defaults())
            .compile_all([descriptor])
            .unwrap();
        chains.install(compiled);
        let chain = chains.get(descriptor.message_type.as_str()).unwrap();
        let routing = RoutingResolver::new(NamingConfig::default())
            .build(&MessageCatalog::new())
            .unwrap();
        let dispatcher = OutboxDispatcher::new(chains, Arc::new(routing), Arc::new(InMemoryTransport::new()));
        (chain, dispatcher)
    }

    fn update_todo() -> crate::chain::HandlerDescriptor {
        descriptor("Todos", "update")
            .with_handler(GetTodo)
            .with_parameter(Parameter::Body(TypeRef::from_static("app::UpdateTodo")))
            .with_parameter(Parameter::Route("id".into()))
            .returning(ReturnType::task(ReturnType::Value(TypeRef::from_static("app::Todo"))))
            .annotated(Annotation::route(Method::PUT, "/todos/{id}"))
    }

    fn put(path: &str, body: &str) -> Request<Bytes> {
        Request::builder()
            .method(Method::PUT)
            .uri(path)
            .header(CONTENT_TYPE, "application/json")
            .body(Bytes::from(body.to_string()))
            .unwrap()
    }

    fn json_body(response: &Response<Bytes>) -> Value {
        serde_json::from_slice(response.body()).unwrap()
    }

    #[test]
    fn route_matching_binds_named_segments() {
        assert_eq!(
            match_route("/todos/{id:int}/items/{item}", "/todos/7/items/x"),
            Some(vec![("id".into(), "7".into()), ("item".into(), "x".into())])
        );
        assert_eq!(match_route("/todos/{id}", "/todos"), None);
        assert_eq!(match_route("/todos/{id}", "/users/1"), None);
        assert_eq!(match_route("/health", "/health/"), Some(vec![]));
    }

    #[tokio::test]
    async fn resource_is_written_with_success_status() {
        let invoker = invoker(update_todo());
        let response = invoker
            .invoke(put("/todos/7", r#"{"title":"milk"}"#), None, &CancellationToken::new())
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(json_body(&response), json!({"id": "7", "title": "milk"}));
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let invoker = invoker(update_todo());
        let response = invoker
            .invoke(put("/todos/7", "{not json"), None, &CancellationToken::new())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_path_and_method_are_rejected() {
        let invoker = invoker(update_todo());
        let response = invoker
            .invoke(put("/users/7", "{}"), None, &CancellationToken::new())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let get = Request::builder()
            .method(Method::GET)
            .uri("/todos/7")
            .body(Bytes::new())
            .unwrap();
        let response = invoker.invoke(get, None, &CancellationToken::new()).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn no_resource_type_answers_no_content() {
        let invoker = invoker(
            descriptor("Todos", "delete").annotated(Annotation::route(Method::DELETE, "/todos/{id}")),
        );
        let request = Request::builder()
            .method(Method::DELETE)
            .uri("/todos/3")
            .body(Bytes::new())
            .unwrap();
        let response = invoker.invoke(request, None, &CancellationToken::new()).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.body().is_empty());
    }

    #[tokio::test]
    async fn handler_fault_is_internal_error() {
        let invoker = invoker(update_todo());
        let response = invoker
            .invoke(put("/todos/missing", "{}"), None, &CancellationToken::new())
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(&response)["status"], 500);
    }

    #[tokio::test]
    async fn authorization_stop_answers_with_step_reply() {
        let invoker = invoker(update_todo().annotated(Annotation::authorize_policy("editor")));

        let anonymous = invoker
            .invoke(put("/todos/7", "{}"), None, &CancellationToken::new())
            .await;
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let viewer = invoker
            .invoke(put("/todos/7", "{}"), Some(CallerIdentity::new("u-1")), &CancellationToken::new())
            .await;
        assert_eq!(viewer.status(), StatusCode::FORBIDDEN);

        let editor = invoker
            .invoke(
                put("/todos/7", "{}"),
                Some(CallerIdentity::new("u-2").with_policy("editor")),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(editor.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn shed_request_answers_service_unavailable() {
        let (chain, dispatcher) = compiled(&update_todo());
        let invoker = EndpointInvoker::new(chain, BoxCloneService::new(LoadShedLayer::new(0).layer(dispatcher)));
        let response = invoker
            .invoke(put("/todos/7", "{}"), None, &CancellationToken::new())
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(&response)["status"], 503);
    }
}
