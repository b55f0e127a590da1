//! The uniform contract shared by middleware steps and terminal handlers.

use async_trait::async_trait;

use super::context::HandlerContext;
use crate::error::ExecutionFault;

/// What the pipeline does after a middleware step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Run the next step (or the terminal handler).
    Continue,
    /// Skip everything that remains. The chain still completes successfully.
    Stop,
}

/// A middleware step in a compiled chain.
#[async_trait]
pub trait Step: Send + Sync {
    /// Name reported in logs and chain descriptions.
    fn name(&self) -> &str;

    async fn invoke(&self, ctx: &mut HandlerContext<'_>) -> Result<Continuation, ExecutionFault>;
}

/// The terminal invocation of a chain.
///
/// Returns the resource value, if any. Chains whose resource type is none
/// ignore a returned value.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &mut HandlerContext<'_>) -> anyhow::Result<Option<serde_json::Value>>;
}

/// Adapts a synchronous closure into a [`Step`].
pub struct FnStep<F> {
    name: String,
    f: F,
}

impl<F> FnStep<F>
where
    F: Fn(&mut HandlerContext<'_>) -> Result<Continuation, ExecutionFault> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> Step for FnStep<F>
where
    F: Fn(&mut HandlerContext<'_>) -> Result<Continuation, ExecutionFault> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, ctx: &mut HandlerContext<'_>) -> Result<Continuation, ExecutionFault> {
        (self.f)(ctx)
    }
}
