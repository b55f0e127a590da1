//! Transactional outbox: units of work, retry policy, dispatcher, relay.
//!
//! - [`memory`]: in-memory [`OutboxStore`](crate::traits::OutboxStore) and the
//!   ephemeral unit of work used without a store
//! - [`retry`]: retry/dead-letter decisions
//! - [`dispatcher`]: one-envelope execution state machine
//! - [`hook`]: observation of dispatch transitions
//! - [`relay`]: background re-send of pending envelopes

pub mod dispatcher;
pub mod hook;
pub mod memory;
pub mod relay;
pub mod retry;

pub use dispatcher::{drive_attempts, Delivery, DispatchOutcome, FlushReport, OutboxDispatcher};
pub use hook::{DispatchHook, DispatchState, RecordingDispatchHook, TracingDispatchHook};
pub use memory::{EphemeralUnitOfWork, InMemoryOutboxStore};
pub use relay::{OutboxRelay, RelayHandle};
pub use retry::{DelayPolicy, RetryDecision, RetryDelay, RetryPolicy};
