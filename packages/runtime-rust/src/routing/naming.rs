//! Destination naming convention.

use serde::{Deserialize, Serialize};

pub const DEFAULT_DEAD_LETTER_SUFFIX: &str = ".dead-letter";

/// Inputs of the naming convention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Prepended to every destination as `prefix.name`.
    pub prefix: Option<String>,
    pub dead_letter_enabled: bool,
    pub dead_letter_suffix: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            dead_letter_enabled: true,
            dead_letter_suffix: DEFAULT_DEAD_LETTER_SUFFIX.to_string(),
        }
    }
}

impl NamingConfig {
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    #[must_use]
    pub fn without_dead_letters(mut self) -> Self {
        self.dead_letter_enabled = false;
        self
    }

    #[must_use]
    pub fn with_dead_letter_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.dead_letter_suffix = suffix.into();
        self
    }

    /// Primary destination for a canonical message name.
    #[must_use]
    pub fn primary(&self, canonical: &str) -> String {
        match self.prefix.as_deref().filter(|p| !p.is_empty()) {
            Some(prefix) => format!("{prefix}.{canonical}"),
            None => canonical.to_string(),
        }
    }

    /// Dead-letter destination paired with `primary`, when dead-lettering is on.
    #[must_use]
    pub fn dead_letter(&self, primary: &str) -> Option<String> {
        self.dead_letter_enabled
            .then(|| format!("{primary}{}", self.dead_letter_suffix))
    }
}
