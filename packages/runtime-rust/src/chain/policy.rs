//! Middleware policies: cross-cutting steps contributed at compile time.
//!
//! Each registered [`Policy`] is asked, in registration order, whether it
//! wants a step in a given chain. Contributed steps are appended in that
//! order, so the compiled pipeline order is the registration order.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{Envelope, Message};
use http::StatusCode;
use serde_json::json;

use super::context::HandlerContext;
use super::descriptor::HandlerDescriptor;
use super::metadata::ChainMetadata;
use super::step::{Continuation, Step};
use crate::error::ExecutionFault;

/// Contributes middleware steps to chains.
pub trait Policy: Send + Sync {
    fn name(&self) -> &'static str;

    /// The step to add to this chain, or `None` when the policy does not apply.
    fn apply(&self, descriptor: &HandlerDescriptor, metadata: &ChainMetadata) -> Option<Arc<dyn Step>>;
}

/// Ordered set of policies consulted by the compiler.
#[derive(Clone, Default)]
pub struct PolicyRegistry {
    policies: Vec<Arc<dyn Policy>>,
}

impl PolicyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in [`AuthorizationPolicy`].
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(AuthorizationPolicy);
        registry
    }

    pub fn register(&mut self, policy: impl Policy + 'static) {
        self.policies.push(Arc::new(policy));
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.policies.iter().map(|p| p.name()).collect()
    }

    pub(crate) fn steps_for(
        &self,
        descriptor: &HandlerDescriptor,
        metadata: &ChainMetadata,
    ) -> Vec<Arc<dyn Step>> {
        self.policies
            .iter()
            .filter_map(|p| p.apply(descriptor, metadata))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

/// Adds an [`AuthorizeStep`] to every chain whose metadata requires authorization.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizationPolicy;

impl Policy for AuthorizationPolicy {
    fn name(&self) -> &'static str {
        "authorization"
    }

    fn apply(&self, _descriptor: &HandlerDescriptor, metadata: &ChainMetadata) -> Option<Arc<dyn Step>> {
        metadata.authorization.required.then(|| {
            Arc::new(AuthorizeStep {
                policies: metadata.authorization.policies.clone(),
            }) as Arc<dyn Step>
        })
    }
}

/// Stops anonymous callers with 401 and callers missing a required policy with 403.
#[derive(Debug)]
pub struct AuthorizeStep {
    policies: BTreeSet<String>,
}

#[async_trait]
impl Step for AuthorizeStep {
    fn name(&self) -> &str {
        "authorize"
    }

    async fn invoke(&self, ctx: &mut HandlerContext<'_>) -> Result<Continuation, ExecutionFault> {
        let Some(caller) = ctx.envelope().caller() else {
            ctx.respond(StatusCode::UNAUTHORIZED, None);
            return Ok(Continuation::Stop);
        };

        let missing: Vec<&String> = self
            .policies
            .iter()
            .filter(|p| !caller.has_policy(p))
            .collect();
        if missing.is_empty() {
            return Ok(Continuation::Continue);
        }

        tracing::debug!(caller = %caller.id, ?missing, "caller lacks required policies");
        ctx.respond(StatusCode::FORBIDDEN, Some(json!({ "missing_policies": missing })));
        Ok(Continuation::Stop)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

type Validator = Arc<dyn Fn(&Envelope) -> Vec<String> + Send + Sync>;

/// Per-message-type validation. Chains for a type with a registered validator
/// get a [`ValidateStep`]; problems stop the chain with 400.
#[derive(Clone, Default)]
pub struct ValidationPolicy {
    validators: HashMap<String, Validator>,
}

impl ValidationPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a validator returning the problems found in a message.
    #[must_use]
    pub fn validate<M, F>(mut self, check: F) -> Self
    where
        M: Message,
        F: Fn(&M) -> Vec<String> + Send + Sync + 'static,
    {
        let validator: Validator = Arc::new(move |envelope: &Envelope| match envelope.message::<M>() {
            Ok(message) => check(&message),
            Err(err) => vec![err.to_string()],
        });
        self.validators.insert(M::MESSAGE_TYPE.to_string(), validator);
        self
    }
}

impl Policy for ValidationPolicy {
    fn name(&self) -> &'static str {
        "validation"
    }

    fn apply(&self, descriptor: &HandlerDescriptor, _metadata: &ChainMetadata) -> Option<Arc<dyn Step>> {
        self.validators
            .get(descriptor.message_type.as_str())
            .map(|validator| {
                Arc::new(ValidateStep {
                    validator: Arc::clone(validator),
                }) as Arc<dyn Step>
            })
    }
}

pub struct ValidateStep {
    validator: Validator,
}

#[async_trait]
impl Step for ValidateStep {
    fn name(&self) -> &str {
        "validate"
    }

    async fn invoke(&self, ctx: &mut HandlerContext<'_>) -> Result<Continuation, ExecutionFault> {
        let problems = (self.validator)(ctx.envelope());
        if problems.is_empty() {
            return Ok(Continuation::Continue);
        }
        ctx.respond(StatusCode::BAD_REQUEST, Some(json!({ "errors": problems })));
        Ok(Continuation::Stop)
    }
}

#[cfg(test)]
mod tests {
    use courier_core::CallerIdentity;
    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::chain::descriptor::Annotation;
    use crate::chain::metadata::extract_metadata;
    use crate::chain::testing::{descriptor, descriptor_for};
    use crate::outbox::memory::EphemeralUnitOfWork;

    #[derive(Debug, Serialize, Deserialize)]
    struct Signup {
        email: String,
    }

    impl Message for Signup {
        const MESSAGE_TYPE: &'static str = "tests::Signup";
    }

    async fn run(step: &dyn Step, envelope: &Envelope) -> (Continuation, Option<StatusCode>) {
        let mut uow = EphemeralUnitOfWork::default();
        let mut ctx = HandlerContext::new(envelope, &mut uow, false, CancellationToken::new());
        let continuation = step.invoke(&mut ctx).await.unwrap();
        (continuation, ctx.reply().status)
    }

    fn authorize_step(policies: &[&str]) -> AuthorizeStep {
        AuthorizeStep {
            policies: policies.iter().map(|p| (*p).to_string()).collect(),
        }
    }

    #[test]
    fn authorization_policy_only_applies_when_required() {
        let open = descriptor("Open", "hello");
        let metadata = extract_metadata(&open).unwrap();
        assert!(AuthorizationPolicy.apply(&open, &metadata).is_none());

        let secured = descriptor("Secured", "hello").annotated(Annotation::authorize());
        let metadata = extract_metadata(&secured).unwrap();
        assert!(AuthorizationPolicy.apply(&secured, &metadata).is_some());
    }

    #[tokio::test]
    async fn anonymous_caller_is_stopped_with_401() {
        let envelope = Envelope::new(&Signup { email: "a@b.c".into() }).unwrap();
        let (continuation, status) = run(&authorize_step(&[]), &envelope).await;
        assert_eq!(continuation, Continuation::Stop);
        assert_eq!(status, Some(StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn caller_missing_policy_is_stopped_with_403() {
        let envelope = Envelope::new(&Signup { email: "a@b.c".into() })
            .unwrap()
            .with_caller(CallerIdentity::new("u-1").with_policy("staff"));
        let (continuation, status) = run(&authorize_step(&["staff", "admin"]), &envelope).await;
        assert_eq!(continuation, Continuation::Stop);
        assert_eq!(status, Some(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn caller_with_all_policies_continues() {
        let envelope = Envelope::new(&Signup { email: "a@b.c".into() })
            .unwrap()
            .with_caller(CallerIdentity::new("u-1").with_policy("admin"));
        let (continuation, status) = run(&authorize_step(&["admin"]), &envelope).await;
        assert_eq!(continuation, Continuation::Continue);
        assert!(status.is_none());
    }

    #[tokio::test]
    async fn validation_problems_stop_with_400() {
        let policy = ValidationPolicy::new().validate(|m: &Signup| {
            if m.email.contains('@') {
                Vec::new()
            } else {
                vec!["email is invalid".to_string()]
            }
        });
        let d = descriptor_for::<Signup>("Accounts", "signup");
        let metadata = extract_metadata(&d).unwrap();
        let step = policy.apply(&d, &metadata).unwrap();

        let bad = Envelope::new(&Signup { email: "nope".into() }).unwrap();
        let (continuation, status) = run(step.as_ref(), &bad).await;
        assert_eq!(continuation, Continuation::Stop);
        assert_eq!(status, Some(StatusCode::BAD_REQUEST));

        let good = Envelope::new(&Signup { email: "a@b.c".into() }).unwrap();
        let (continuation, _) = run(step.as_ref(), &good).await;
        assert_eq!(continuation, Continuation::Continue);
    }

    #[test]
    fn registry_keeps_registration_order() {
        let mut registry = PolicyRegistry::with_defaults();
        registry.register(ValidationPolicy::new());
        assert_eq!(registry.names(), vec!["authorization", "validation"]);
    }
}
