//! Chain compilation: descriptor + metadata + policies -> immutable [`Chain`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use courier_core::TypeRef;
use tracing::instrument;

use super::context::HandlerContext;
use super::descriptor::HandlerDescriptor;
use super::metadata::{extract_metadata, ChainMetadata};
use super::policy::PolicyRegistry;
use super::step::{Continuation, Handler, Step};
use crate::error::{CompilationError, ConfigurationError, ExecutionFault, StartupError};

/// How a chain execution ended without a fault.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    /// The terminal handler ran. `result` is `None` when the chain has no
    /// resource type.
    Completed { result: Option<serde_json::Value> },
    /// A middleware step stopped the pipeline; the terminal handler was skipped.
    Stopped { step: String },
}

/// A compiled, executable pipeline for one message type.
///
/// Chains are immutable after compilation and are shared across concurrent
/// executions.
pub struct Chain {
    message_type: TypeRef,
    handler_name: String,
    steps: Vec<Arc<dyn Step>>,
    handler: Arc<dyn Handler>,
    metadata: ChainMetadata,
    publishes: Vec<TypeRef>,
    uses_bus: bool,
}

impl Chain {
    #[must_use]
    pub fn message_type(&self) -> &TypeRef {
        &self.message_type
    }

    /// `Group::handler` of the terminal invocation.
    #[must_use]
    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    #[must_use]
    pub fn metadata(&self) -> &ChainMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn resource_type(&self) -> Option<&TypeRef> {
        self.metadata.resource_type.as_ref()
    }

    #[must_use]
    pub fn requires_outbox(&self) -> bool {
        self.metadata.requires_outbox
    }

    /// Whether handlers get a message bus when this chain runs.
    #[must_use]
    pub fn has_message_bus(&self) -> bool {
        self.uses_bus
    }

    #[must_use]
    pub fn publishes(&self) -> &[TypeRef] {
        &self.publishes
    }

    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run the middleware steps in order, then the terminal handler.
    ///
    /// Steps run strictly one after another. The cancellation token is checked
    /// before every step and raced against each step and the handler; once it
    /// fires the remaining pipeline is abandoned.
    ///
    /// # Errors
    ///
    /// Returns the first [`ExecutionFault`] raised by a step or the handler, or
    /// [`ExecutionFault::Cancelled`].
    pub async fn execute(&self, ctx: &mut HandlerContext<'_>) -> Result<ChainOutcome, ExecutionFault> {
        let cancel = ctx.cancellation().clone();

        for step in &self.steps {
            if cancel.is_cancelled() {
                return Err(ExecutionFault::Cancelled);
            }
            let continuation = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ExecutionFault::Cancelled),
                result = step.invoke(ctx) => result?,
            };
            if continuation == Continuation::Stop {
                tracing::debug!(step = step.name(), chain = %self.message_type, "pipeline stopped");
                return Ok(ChainOutcome::Stopped {
                    step: step.name().to_string(),
                });
            }
        }

        if cancel.is_cancelled() {
            return Err(ExecutionFault::Cancelled);
        }
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ExecutionFault::Cancelled),
            result = self.handler.handle(ctx) => result?,
        };

        Ok(ChainOutcome::Completed {
            result: result.filter(|_| self.metadata.resource_type.is_some()),
        })
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("message_type", &self.message_type)
            .field("handler", &self.handler_name)
            .field("steps", &self.step_names())
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Compiles handler descriptors into chains.
#[derive(Clone)]
pub struct ChainCompiler {
    policies: PolicyRegistry,
    outbox_bound: bool,
}

impl ChainCompiler {
    /// A compiler with no outbox binding.
    #[must_use]
    pub fn new(policies: PolicyRegistry) -> Self {
        Self {
            policies,
            outbox_bound: false,
        }
    }

    /// Declare whether an outbox store will be available when chains run.
    #[must_use]
    pub fn with_outbox_binding(mut self, bound: bool) -> Self {
        self.outbox_bound = bound;
        self
    }

    /// Compile one descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::Compilation`] for conflicting annotations and
    /// [`ConfigurationError::MissingOutboxBinding`] when the chain requires the
    /// outbox but the compiler has no outbox binding.
    #[instrument(skip_all, fields(handler = %descriptor.qualified_name()))]
    pub fn compile(&self, descriptor: &HandlerDescriptor) -> Result<Chain, StartupError> {
        let metadata = extract_metadata(descriptor)?;

        if metadata.requires_outbox && !self.outbox_bound {
            return Err(ConfigurationError::MissingOutboxBinding {
                handler: descriptor.qualified_name(),
            }
            .into());
        }

        let steps = self.policies.steps_for(descriptor, &metadata);
        let chain = Chain {
            message_type: descriptor.message_type.clone(),
            handler_name: descriptor.qualified_name(),
            steps,
            handler: Arc::clone(&descriptor.handler),
            metadata,
            publishes: descriptor.publishes.clone(),
            uses_bus: descriptor.uses_message_bus(),
        };

        tracing::debug!(
            message_type = %chain.message_type,
            steps = ?chain.step_names(),
            resource_type = ?chain.resource_type(),
            requires_outbox = chain.requires_outbox(),
            "compiled chain"
        );
        Ok(chain)
    }

    /// Compile every descriptor, keyed by message type.
    ///
    /// # Errors
    ///
    /// Fails on the first descriptor that does not compile, or with
    /// [`CompilationError::DuplicateHandler`] when two descriptors handle the
    /// same message type.
    pub fn compile_all<'a>(
        &self,
        descriptors: impl IntoIterator<Item = &'a HandlerDescriptor>,
    ) -> Result<HashMap<String, Arc<Chain>>, StartupError> {
        let mut chains: HashMap<String, Arc<Chain>> = HashMap::new();
        for descriptor in descriptors {
            let key = descriptor.message_type.as_str().to_string();
            if let Some(existing) = chains.get(&key) {
                return Err(CompilationError::DuplicateHandler {
                    message_type: key,
                    first: existing.handler_name().to_string(),
                    second: descriptor.qualified_name(),
                }
                .into());
            }
            let chain = self.compile(descriptor)?;
            chains.insert(key, Arc::new(chain));
        }
        Ok(chains)
    }
}
