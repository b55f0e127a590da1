//! In-memory outbox store for tests and local pipelines.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::Envelope;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::OutboxError;
use crate::traits::{OutboxStore, UnitOfWork};

/// A committed outgoing envelope awaiting confirmation of its send.
#[derive(Debug, Clone)]
struct PendingRow {
    origin: Uuid,
    envelope: Envelope,
    claimed: bool,
}

#[derive(Debug, Default)]
struct StoreState {
    state: BTreeMap<String, serde_json::Value>,
    pending: Vec<PendingRow>,
    handled: HashSet<Uuid>,
    commits: u64,
    rollbacks: u64,
    fail_commits: u32,
}

/// Outbox store holding application state, pending envelopes and handled
/// markers in process memory.
///
/// Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutboxStore {
    inner: Arc<Mutex<StoreState>>,
}

impl InMemoryOutboxStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed application state under `key`.
    #[must_use]
    pub fn state(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.lock().state.get(key).cloned()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Pending envelopes currently claimed by a flusher.
    #[must_use]
    pub fn claimed_count(&self) -> usize {
        self.inner.lock().pending.iter().filter(|row| row.claimed).count()
    }

    #[must_use]
    pub fn commits(&self) -> u64 {
        self.inner.lock().commits
    }

    #[must_use]
    pub fn rollbacks(&self) -> u64 {
        self.inner.lock().rollbacks
    }

    /// Make the next `count` commits fail.
    pub fn fail_next_commits(&self, count: u32) {
        self.inner.lock().fail_commits = count;
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn begin(&self, incoming: &Envelope) -> Result<Box<dyn UnitOfWork>, OutboxError> {
        Ok(Box::new(InMemoryUnitOfWork {
            store: Arc::clone(&self.inner),
            incoming: incoming.id(),
            staged: Vec::new(),
            outgoing: Vec::new(),
        }))
    }

    async fn is_handled(&self, incoming: Uuid) -> Result<bool, OutboxError> {
        Ok(self.inner.lock().handled.contains(&incoming))
    }

    async fn pending(&self) -> Result<Vec<Envelope>, OutboxError> {
        Ok(self.inner.lock().pending.iter().map(|row| row.envelope.clone()).collect())
    }

    async fn claim_pending(&self, origin: Option<Uuid>) -> Result<Vec<Envelope>, OutboxError> {
        let mut state = self.inner.lock();
        let claimed = state
            .pending
            .iter_mut()
            .filter(|row| !row.claimed && origin.is_none_or(|origin| row.origin == origin))
            .map(|row| {
                row.claimed = true;
                row.envelope.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn release(&self, ids: &[Uuid]) -> Result<(), OutboxError> {
        let mut state = self.inner.lock();
        for row in state.pending.iter_mut().filter(|row| ids.contains(&row.envelope.id())) {
            row.claimed = false;
        }
        Ok(())
    }

    async fn append_pending(&self, origin: Uuid, envelope: Envelope) -> Result<(), OutboxError> {
        let mut state = self.inner.lock();
        let id = envelope.id();
        match state.pending.iter_mut().find(|row| row.envelope.id() == id) {
            Some(row) => {
                row.envelope = envelope;
                row.claimed = false;
            }
            None => state.pending.push(PendingRow {
                origin,
                envelope,
                claimed: false,
            }),
        }
        Ok(())
    }

    async fn mark_flushed(&self, ids: &[Uuid]) -> Result<(), OutboxError> {
        let mut state = self.inner.lock();
        state.pending.retain(|row| !ids.contains(&row.envelope.id()));
        Ok(())
    }
}

/// Unit of work against an [`InMemoryOutboxStore`]. Everything is buffered
/// locally and applied under one lock on commit.
struct InMemoryUnitOfWork {
    store: Arc<Mutex<StoreState>>,
    incoming: Uuid,
    staged: Vec<(String, serde_json::Value)>,
    outgoing: Vec<Envelope>,
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    fn stage(&mut self, key: &str, value: serde_json::Value) {
        self.staged.push((key.to_string(), value));
    }

    fn buffer_outgoing(&mut self, envelope: Envelope) {
        self.outgoing.push(envelope);
    }

    async fn commit(&mut self) -> Result<Vec<Envelope>, OutboxError> {
        let mut state = self.store.lock();
        if state.fail_commits > 0 {
            state.fail_commits -= 1;
            return Err(OutboxError::Commit("injected commit failure".into()));
        }

        for (key, value) in self.staged.drain(..) {
            state.state.insert(key, value);
        }
        let outgoing = std::mem::take(&mut self.outgoing);
        let origin = self.incoming;
        state.pending.extend(outgoing.iter().map(|envelope| PendingRow {
            origin,
            envelope: envelope.clone(),
            claimed: true,
        }));
        state.handled.insert(self.incoming);
        state.commits += 1;
        Ok(outgoing)
    }

    async fn rollback(&mut self) -> Result<(), OutboxError> {
        self.staged.clear();
        self.outgoing.clear();
        self.store.lock().rollbacks += 1;
        Ok(())
    }
}

/// Unit of work used when no outbox store is bound. Staged state is kept only
/// for the lifetime of the execution; commit hands back the buffered envelopes.
#[derive(Debug, Default)]
pub struct EphemeralUnitOfWork {
    staged: BTreeMap<String, serde_json::Value>,
    outgoing: Vec<Envelope>,
}

impl EphemeralUnitOfWork {
    #[must_use]
    pub fn staged(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.staged
    }
}

#[async_trait]
impl UnitOfWork for EphemeralUnitOfWork {
    fn stage(&mut self, key: &str, value: serde_json::Value) {
        self.staged.insert(key.to_string(), value);
    }

    fn buffer_outgoing(&mut self, envelope: Envelope) {
        self.outgoing.push(envelope);
    }

    async fn commit(&mut self) -> Result<Vec<Envelope>, OutboxError> {
        Ok(std::mem::take(&mut self.outgoing))
    }

    async fn rollback(&mut self) -> Result<(), OutboxError> {
        self.staged.clear();
        self.outgoing.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn envelope(kind: &str) -> Envelope {
        Envelope::from_parts(kind, json!({}))
    }

    #[tokio::test]
    async fn commit_persists_state_and_outgoing_together() {
        let store = InMemoryOutboxStore::new();
        let incoming = envelope("app::Incoming");
        let mut uow = store.begin(&incoming).await.unwrap();
        uow.stage("orders/1", json!({"status": "placed"}));
        uow.buffer_outgoing(envelope("app::Placed"));

        assert!(store.state("orders/1").is_none());
        assert_eq!(store.pending_count(), 0);

        let pending = uow.commit().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(store.state("orders/1"), Some(json!({"status": "placed"})));
        assert_eq!(store.pending_count(), 1);
        assert!(store.is_handled(incoming.id()).await.unwrap());
    }

    #[tokio::test]
    async fn rollback_discards_everything() {
        let store = InMemoryOutboxStore::new();
        let incoming = envelope("app::Incoming");
        let mut uow = store.begin(&incoming).await.unwrap();
        uow.stage("orders/1", json!(1));
        uow.buffer_outgoing(envelope("app::Placed"));
        uow.rollback().await.unwrap();

        assert!(store.state("orders/1").is_none());
        assert_eq!(store.pending_count(), 0);
        assert_eq!(store.rollbacks(), 1);
        assert!(!store.is_handled(incoming.id()).await.unwrap());
    }

    #[tokio::test]
    async fn injected_commit_failure_leaves_store_untouched() {
        let store = InMemoryOutboxStore::new();
        store.fail_next_commits(1);
        let incoming = envelope("app::Incoming");
        let mut uow = store.begin(&incoming).await.unwrap();
        uow.stage("k", json!(1));
        assert!(matches!(uow.commit().await, Err(OutboxError::Commit(_))));
        assert!(store.state("k").is_none());
        assert_eq!(store.commits(), 0);
    }

    #[tokio::test]
    async fn mark_flushed_removes_only_named_envelopes() {
        let store = InMemoryOutboxStore::new();
        let mut uow = store.begin(&envelope("app::Incoming")).await.unwrap();
        let first = envelope("app::A");
        let second = envelope("app::B");
        uow.buffer_outgoing(first.clone());
        uow.buffer_outgoing(second.clone());
        uow.commit().await.unwrap();

        store.mark_flushed(&[first.id()]).await.unwrap();
        let pending = store.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id(), second.id());
    }

    #[tokio::test]
    async fn committed_rows_stay_claimed_until_released() {
        let store = InMemoryOutboxStore::new();
        let mut uow = store.begin(&envelope("app::Incoming")).await.unwrap();
        let placed = envelope("app::Placed");
        uow.buffer_outgoing(placed.clone());
        uow.commit().await.unwrap();

        assert_eq!(store.claimed_count(), 1);
        assert!(store.claim_pending(None).await.unwrap().is_empty());

        store.release(&[placed.id()]).await.unwrap();
        let claimed = store.claim_pending(None).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(store.claim_pending(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claims_can_be_scoped_to_one_incoming_envelope() {
        let store = InMemoryOutboxStore::new();
        let first_incoming = envelope("app::Incoming");
        let second_incoming = envelope("app::Incoming");
        for incoming in [&first_incoming, &second_incoming] {
            let mut uow = store.begin(incoming).await.unwrap();
            uow.buffer_outgoing(envelope("app::Placed"));
            let committed = uow.commit().await.unwrap();
            let ids: Vec<Uuid> = committed.iter().map(Envelope::id).collect();
            store.release(&ids).await.unwrap();
        }

        let claimed = store.claim_pending(Some(first_incoming.id())).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(store.claimed_count(), 1);
        assert_eq!(store.claim_pending(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn appended_envelopes_are_claimable() {
        let store = InMemoryOutboxStore::new();
        let dead = envelope("app::Incoming");
        store.append_pending(dead.id(), dead.clone()).await.unwrap();
        store.append_pending(dead.id(), dead.clone()).await.unwrap();

        assert_eq!(store.pending_count(), 1);
        let claimed = store.claim_pending(None).await.unwrap();
        assert_eq!(claimed[0].id(), dead.id());
    }
}
