//! In-memory transport for tests and local pipelines.
//!
//! Envelopes are queued per destination. `receive` pops from the inbound
//! queue, which is fed either by tests (`inject`) or by sends to a destination
//! registered with `listen`.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::Envelope;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::TransportFault;
use crate::traits::TransportEndpoint;

#[derive(Debug, Default)]
struct Shared {
    queues: DashMap<String, VecDeque<Envelope>>,
    sent: Mutex<Vec<Envelope>>,
    inbound: Mutex<VecDeque<Envelope>>,
    listening: Mutex<HashSet<String>>,
    fail_sends: Mutex<u32>,
    unreachable: Mutex<HashSet<String>>,
}

/// Clones share the same queues.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    shared: Arc<Shared>,
}

impl InMemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loop envelopes sent to `destination` back into the inbound queue.
    pub fn listen(&self, destination: impl Into<String>) {
        self.shared.listening.lock().insert(destination.into());
    }

    /// Push an envelope onto the inbound queue.
    pub fn inject(&self, envelope: Envelope) {
        self.shared.inbound.lock().push_back(envelope);
    }

    /// Every envelope successfully sent, in send order.
    #[must_use]
    pub fn sent(&self) -> Vec<Envelope> {
        self.shared.sent.lock().clone()
    }

    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.shared.sent.lock().len()
    }

    /// Take everything queued for `destination`.
    #[must_use]
    pub fn drain(&self, destination: &str) -> Vec<Envelope> {
        self.shared
            .queues
            .get_mut(destination)
            .map(|mut queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Fail the next `count` sends regardless of destination.
    pub fn fail_next_sends(&self, count: u32) {
        *self.shared.fail_sends.lock() = count;
    }

    /// Fail every send to `destination` until [`InMemoryTransport::restore`].
    pub fn make_unreachable(&self, destination: impl Into<String>) {
        self.shared.unreachable.lock().insert(destination.into());
    }

    pub fn restore(&self, destination: &str) {
        self.shared.unreachable.lock().remove(destination);
    }
}

#[async_trait]
impl TransportEndpoint for InMemoryTransport {
    #[tracing::instrument(skip_all, fields(envelope_id = %envelope.id()))]
    async fn send(&self, envelope: Envelope) -> Result<(), TransportFault> {
        let Some(destination) = envelope.destination().map(str::to_string) else {
            return Err(TransportFault::NoDestination {
                envelope_id: envelope.id(),
            });
        };

        {
            let mut fail_sends = self.shared.fail_sends.lock();
            if *fail_sends > 0 {
                *fail_sends -= 1;
                return Err(TransportFault::Send {
                    destination,
                    reason: "injected send failure".into(),
                });
            }
        }
        if self.shared.unreachable.lock().contains(&destination) {
            return Err(TransportFault::Send {
                destination,
                reason: "destination unreachable".into(),
            });
        }

        self.shared.sent.lock().push(envelope.clone());
        if self.shared.listening.lock().contains(&destination) {
            self.shared.inbound.lock().push_back(envelope.clone());
        }
        self.shared
            .queues
            .entry(destination.clone())
            .or_default()
            .push_back(envelope);
        tracing::debug!(%destination, "envelope queued in memory");
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Envelope>, TransportFault> {
        Ok(self.shared.inbound.lock().pop_front())
    }
}
