use serde::{Deserialize, Serialize};

/// Identity of whoever produced an envelope, carried across the producer/consumer
/// boundary for authorization and audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    /// Unique identifier for the authenticated entity.
    pub id: String,
    /// Policy names granted to this caller. Authorization middleware checks
    /// required policies against this list.
    pub policies: Vec<String>,
}

impl CallerIdentity {
    /// Creates an identity with no granted policies.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            policies: Vec::new(),
        }
    }

    /// Grants an additional policy name.
    #[must_use]
    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policies.push(policy.into());
        self
    }

    /// Whether this caller holds the named policy.
    #[must_use]
    pub fn has_policy(&self, policy: &str) -> bool {
        self.policies.iter().any(|p| p == policy)
    }
}
