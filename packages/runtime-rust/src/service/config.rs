//! Runtime configuration.
//!
//! [`RuntimeConfig`] is deserialized from JSON (every field optional, falling
//! back to [`Default`]); [`RuntimeArgs`] carries command-line and `COURIER_*`
//! environment overrides applied on top.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::outbox::retry::{DelayPolicy, RetryDelay, RetryPolicy};
use crate::routing::NamingConfig;
use crate::telemetry::LogFormat;

/// Retry settings as they appear in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_policy: DelayPolicy,
    pub base_delay_ms: u64,
    /// Cap for backoff delays. Ignored by the fixed policy.
    pub max_delay_ms: u64,
    /// Fraction of the delay added at random, 0.0 to 1.0.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_policy: DelayPolicy::Fixed,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn to_policy(&self) -> RetryPolicy {
        let base = Duration::from_millis(self.base_delay_ms);
        let delay = match self.delay_policy {
            DelayPolicy::Fixed => RetryDelay::Fixed(base),
            DelayPolicy::Backoff => RetryDelay::Backoff {
                initial: base,
                max: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
                multiplier: 2.0,
            },
        };
        RetryPolicy {
            max_attempts: self.max_attempts,
            delay,
            jitter: 0.0,
        }
        .with_jitter(self.jitter)
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub node_id: String,
    pub naming: NamingConfig,
    pub conventional_routing: bool,
    pub retry: RetryConfig,
    /// Deliveries beyond this many in flight are shed.
    pub max_concurrent_dispatches: u32,
    /// Per-attempt deadline. Expiry fails the attempt, which is retried.
    pub dispatch_timeout_ms: u64,
    /// Interval of the outbox relay.
    pub relay_interval_ms: u64,
    /// How long shutdown waits for in-flight deliveries.
    pub drain_timeout_ms: u64,
    pub log_format: LogFormat,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            naming: NamingConfig::default(),
            conventional_routing: true,
            retry: RetryConfig::default(),
            max_concurrent_dispatches: 1000,
            dispatch_timeout_ms: 30_000,
            relay_interval_ms: 5_000,
            drain_timeout_ms: 10_000,
            log_format: LogFormat::Pretty,
        }
    }
}

impl RuntimeConfig {
    /// Parse a JSON document; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Invalid`] on malformed JSON or values
    /// that fail [`RuntimeConfig::validate`].
    pub fn from_json_str(json: &str) -> Result<Self, ConfigurationError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigurationError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`ConfigurationError::Invalid`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_concurrent_dispatches == 0 {
            return Err(ConfigurationError::Invalid(
                "max_concurrent_dispatches must be at least 1".into(),
            ));
        }
        if self.dispatch_timeout_ms == 0 {
            return Err(ConfigurationError::Invalid("dispatch_timeout_ms must be positive".into()));
        }
        if self.relay_interval_ms == 0 {
            return Err(ConfigurationError::Invalid("relay_interval_ms must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigurationError::Invalid("retry.jitter must be within 0.0..=1.0".into()));
        }
        if self.naming.dead_letter_enabled && self.naming.dead_letter_suffix.is_empty() {
            return Err(ConfigurationError::Invalid(
                "naming.dead_letter_suffix must not be empty when dead-lettering is enabled".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    #[must_use]
    pub fn relay_interval(&self) -> Duration {
        Duration::from_millis(self.relay_interval_ms)
    }

    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Command-line and environment overrides.
#[derive(Debug, Clone, Default, clap::Parser)]
#[command(name = "courier", about = "Courier dispatch runtime")]
pub struct RuntimeArgs {
    /// JSON configuration file.
    #[arg(long, env = "COURIER_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "COURIER_NODE_ID")]
    pub node_id: Option<String>,

    /// Destination prefix, e.g. `zztop`.
    #[arg(long, env = "COURIER_PREFIX")]
    pub prefix: Option<String>,

    #[arg(long, env = "COURIER_DISABLE_DEAD_LETTERS")]
    pub disable_dead_letters: bool,

    #[arg(long, env = "COURIER_MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,

    #[arg(long, env = "COURIER_DISPATCH_TIMEOUT_MS")]
    pub dispatch_timeout_ms: Option<u64>,

    #[arg(long, env = "COURIER_LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormat>,
}

impl RuntimeArgs {
    /// Load the configuration file (if any) and apply these overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Invalid`] when the file cannot be read or
    /// the result does not validate.
    pub fn resolve(&self) -> Result<RuntimeConfig, ConfigurationError> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    ConfigurationError::Invalid(format!("cannot read {}: {e}", path.display()))
                })?;
                RuntimeConfig::from_json_str(&text)?
            }
            None => RuntimeConfig::default(),
        };
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Apply the overrides that were given.
    pub fn apply(&self, config: &mut RuntimeConfig) {
        if let Some(node_id) = &self.node_id {
            config.node_id.clone_from(node_id);
        }
        if let Some(prefix) = &self.prefix {
            config.naming.prefix = Some(prefix.clone());
        }
        if self.disable_dead_letters {
            config.naming.dead_letter_enabled = false;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.retry.max_attempts = max_attempts;
        }
        if let Some(timeout) = self.dispatch_timeout_ms {
            config.dispatch_timeout_ms = timeout;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
    }
}
