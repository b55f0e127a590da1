//! Handler/endpoint descriptions consumed by the metadata extractor.
//!
//! A description is the explicit, structured form of what a handler declares:
//! its parameter list, its return shape, and the annotations on the handler and
//! on its containing group. Nothing here is discovered by reflection; callers
//! build descriptors and hand them to the compiler.

use std::fmt;
use std::sync::Arc;

use courier_core::TypeRef;
use http::Method;

use super::step::Handler;

/// A declared handler parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parameter {
    /// The request body, bound from the inbound payload.
    Body(TypeRef),
    /// A value bound from a `{name}` segment of the route pattern.
    Route(String),
    /// A message bus capable of enqueueing outgoing envelopes.
    MessageBus,
    /// Any other injected service.
    Service(TypeRef),
    /// The caller's cancellation signal.
    Cancellation,
}

/// Declared return shape of a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnType {
    /// No return value.
    Unit,
    /// A bare completion signal with no value.
    Completion,
    /// A concrete value.
    Value(TypeRef),
    /// An asynchronous wrapper around another return shape.
    Task(Box<ReturnType>),
}

impl ReturnType {
    /// Wraps a return shape in one asynchronous layer.
    #[must_use]
    pub fn task(inner: ReturnType) -> Self {
        Self::Task(Box::new(inner))
    }
}

/// Recognized annotation kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    /// HTTP route the chain is exposed on.
    Route { method: Method, pattern: String },
    /// Content types accepted and produced.
    ContentType(Vec<String>),
    /// Requires an authenticated caller, optionally holding a named policy.
    Authorize { policy: Option<String> },
    /// Declares the body type (or no body) returned with a status code.
    Status { code: u16, body: Option<TypeRef> },
    /// Overrides the inferred resource type.
    ResourceType(TypeRef),
    /// The chain runs inside a transaction owned by the caller.
    ExternalTransaction,
}

impl Annotation {
    #[must_use]
    pub fn route(method: Method, pattern: impl Into<String>) -> Self {
        Self::Route {
            method,
            pattern: pattern.into(),
        }
    }

    #[must_use]
    pub fn authorize() -> Self {
        Self::Authorize { policy: None }
    }

    #[must_use]
    pub fn authorize_policy(policy: impl Into<String>) -> Self {
        Self::Authorize {
            policy: Some(policy.into()),
        }
    }

    #[must_use]
    pub fn status(code: u16, body: Option<TypeRef>) -> Self {
        Self::Status { code, body }
    }
}

/// The group (handler type) a handler is declared on, with its annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDescriptor {
    pub name: String,
    pub annotations: Vec<Annotation>,
}

impl GroupDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            annotations: Vec::new(),
        }
    }

    #[must_use]
    pub fn annotated(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }
}

/// Full description of one handler/endpoint.
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub name: String,
    pub group: GroupDescriptor,
    /// Message type the chain is keyed by.
    pub message_type: TypeRef,
    pub parameters: Vec<Parameter>,
    pub returns: ReturnType,
    pub annotations: Vec<Annotation>,
    /// Message types the handler may publish through its message bus.
    pub publishes: Vec<TypeRef>,
    pub handler: Arc<dyn Handler>,
}

impl HandlerDescriptor {
    /// Starts a description returning `Unit` with no parameters or annotations.
    pub fn new(
        group: &GroupDescriptor,
        name: impl Into<String>,
        message_type: TypeRef,
        handler: impl Handler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            group: group.clone(),
            message_type,
            parameters: Vec::new(),
            returns: ReturnType::Unit,
            annotations: Vec::new(),
            publishes: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    #[must_use]
    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    #[must_use]
    pub fn returning(mut self, returns: ReturnType) -> Self {
        self.returns = returns;
        self
    }

    #[must_use]
    pub fn annotated(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }

    /// Replace the terminal handler.
    #[must_use]
    pub fn with_handler(mut self, handler: impl Handler + 'static) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    #[must_use]
    pub fn publishing(mut self, message_type: TypeRef) -> Self {
        self.publishes.push(message_type);
        self
    }

    /// `Group::handler`, used in diagnostics.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.group.name, self.name)
    }

    /// Whether the handler declared a message bus dependency.
    #[must_use]
    pub fn uses_message_bus(&self) -> bool {
        self.parameters.contains(&Parameter::MessageBus)
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("name", &self.qualified_name())
            .field("message_type", &self.message_type)
            .field("parameters", &self.parameters)
            .field("returns", &self.returns)
            .field("annotations", &self.annotations)
            .finish_non_exhaustive()
    }
}
