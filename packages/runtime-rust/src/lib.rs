//! Courier Runtime: chain compiler, transactional outbox dispatcher, and
//! convention-based routing.

pub mod chain;
pub mod error;
pub mod http;
pub mod outbox;
pub mod routing;
pub mod service;
pub mod telemetry;
pub mod traits;
pub mod transport;

pub use chain::{
    Chain, ChainCache, ChainCompiler, ChainOutcome, Handler, HandlerContext, HandlerDescriptor, MessageBus, Policy,
    PolicyRegistry, Step,
};
pub use error::{
    CompilationError, ConfigurationError, DispatchError, ExecutionFault, OutboxError, RoutingError, StartupError,
    TransportFault,
};
pub use http::{BindResult, EndpointInvoker, JsonRequestBinder, JsonResponseWriter, RequestBinder, ResponseWriter};
pub use outbox::{Delivery, DispatchOutcome, InMemoryOutboxStore, OutboxDispatcher, RetryPolicy};
pub use routing::{MessageCatalog, NamingConfig, RoutingResolver, RoutingTable};
pub use service::{Runtime, RuntimeArgs, RuntimeBuilder, RuntimeConfig};
pub use traits::{OutboxStore, TransportEndpoint, UnitOfWork};
pub use transport::InMemoryTransport;
