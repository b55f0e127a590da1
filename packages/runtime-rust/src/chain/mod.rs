//! Handler chains: descriptors, metadata extraction, policies, compilation.
//!
//! A [`HandlerDescriptor`] is compiled once into an immutable [`Chain`]: the
//! ordered middleware steps contributed by registered policies followed by the
//! terminal handler. Chains are shared through the [`ChainCache`].

pub mod cache;
pub mod compiler;
pub mod context;
pub mod descriptor;
pub mod metadata;
pub mod policy;
pub mod step;

pub use cache::ChainCache;
pub use compiler::{Chain, ChainCompiler, ChainOutcome};
pub use context::{HandlerContext, MessageBus, Reply};
pub use descriptor::{Annotation, GroupDescriptor, HandlerDescriptor, Parameter, ReturnType};
pub use metadata::{
    extract_metadata, infer_resource_type, AcceptsMetadata, AuthorizationRequirement, ChainMetadata,
    ProducesMetadata, RouteInfo,
};
pub use policy::{AuthorizationPolicy, Policy, PolicyRegistry, ValidationPolicy};
pub use step::{Continuation, FnStep, Handler, Step};
