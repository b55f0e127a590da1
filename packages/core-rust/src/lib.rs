//! Courier Core: envelopes, message identities, and caller context.

pub mod clock;
pub mod context;
pub mod envelope;
pub mod message;
pub mod types;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use context::CallerIdentity;
pub use envelope::{Envelope, EnvelopeError, EnvelopeStatus, FailureContext};
pub use message::{Message, JSON_CONTENT_TYPE};
pub use types::TypeRef;
