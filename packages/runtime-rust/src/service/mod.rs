//! Runtime assembly and the delivery pipeline around the dispatcher.
//!
//! 1. **Configuration** (`config`): `RuntimeConfig` plus CLI/env overrides
//! 2. **Lifecycle** (`lifecycle`): startup gating, drain on shutdown
//! 3. **Middleware** (`middleware`): Tower layers (gate, load-shedding, metrics, deadline)
//! 4. **Runtime** (`runtime`): builder with startup validation, relay startup

pub mod config;
pub mod lifecycle;
pub mod middleware;
pub mod runtime;

pub use config::{RetryConfig, RuntimeArgs, RuntimeConfig};
pub use lifecycle::{InFlightGuard, LifecycleController, LifecycleState};
pub use runtime::{Runtime, RuntimeBuilder};
