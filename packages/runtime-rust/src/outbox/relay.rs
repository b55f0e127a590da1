//! Background relay for committed envelopes that were never sent.
//!
//! A crash (or an unreachable transport) between commit and send leaves
//! envelopes pending in the outbox store, and a dead letter whose send failed
//! is parked there too. The relay claims and re-sends them on a fixed
//! interval and on demand, giving at-least-once delivery on the outbound leg.
//! Claiming keeps the relay and the dispatcher's own post-commit flush from
//! sending the same row twice.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::dispatcher::{FlushReport, OutboxDispatcher};

/// Flush requests waiting for the relay task.
const REQUEST_CAPACITY: usize = 16;

pub struct OutboxRelay {
    dispatcher: OutboxDispatcher,
}

impl OutboxRelay {
    #[must_use]
    pub fn new(dispatcher: OutboxDispatcher) -> Self {
        Self { dispatcher }
    }

    /// Claim and send everything pending once.
    pub async fn relay_once(&self) -> FlushReport {
        let report = self.dispatcher.flush_pending().await.unwrap_or_default();
        if report.sent + report.dead_lettered > 0 {
            tracing::info!(
                sent = report.sent,
                dead_lettered = report.dead_lettered,
                deferred = report.deferred,
                "relayed pending outbox envelopes"
            );
        }
        report
    }

    /// Run the relay on its own task, flushing every `interval`.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn(self, interval: Duration) -> RelayHandle {
        let (requests, mut incoming) = mpsc::channel::<oneshot::Sender<FlushReport>>(REQUEST_CAPACITY);
        let stop = CancellationToken::new();
        let stopped = stop.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    () = stopped.cancelled() => break,
                    request = incoming.recv() => match request {
                        Some(reply) => {
                            let _ = reply.send(self.relay_once().await);
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        self.relay_once().await;
                    }
                }
            }

            let last = self.relay_once().await;
            if last.deferred > 0 {
                tracing::warn!(deferred = last.deferred, "outbox still holds pending envelopes at shutdown");
            }
        });

        RelayHandle {
            requests: Some(requests),
            stop,
            task: Some(task),
        }
    }
}

/// Handle to a spawned relay.
pub struct RelayHandle {
    requests: Option<mpsc::Sender<oneshot::Sender<FlushReport>>>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RelayHandle {
    /// Flush now and wait for the report. `None` once the relay has stopped.
    pub async fn flush_now(&self) -> Option<FlushReport> {
        let requests = self.requests.as_ref()?;
        let (reply, report) = oneshot::channel();
        if requests.send(reply).await.is_err() {
            tracing::warn!("outbox relay is not running");
            return None;
        }
        report.await.ok()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the relay after one final flush.
    pub async fn stop(&mut self) {
        self.stop.cancel();
        self.requests.take();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "outbox relay panicked");
            }
        }
    }
}
