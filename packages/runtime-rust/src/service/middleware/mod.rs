//! Tower middleware layers for the dispatch pipeline.
//!
//! - [`gate`]: Lifecycle gating (ready / draining)
//! - [`load_shed`]: Semaphore-based concurrency limiting
//! - [`metrics`]: Delivery timing and outcome via `tracing` spans and `metrics`
//! - [`timeout`]: Per-attempt deadlines
//! - [`pipeline`]: Composes all layers into a single service stack

pub mod gate;
pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use gate::LifecycleGateLayer;
pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_dispatch_pipeline, DispatchService};
pub use timeout::TimeoutLayer;
