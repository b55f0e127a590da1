//! Runtime lifecycle gate with in-flight delivery tracking.
//!
//! Uses `ArcSwap` for lock-free state transitions and an atomic counter with
//! RAII guards for in-flight tracking. Deliveries are only accepted while the
//! runtime is `Ready`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;

/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Chains, routes and bindings are being validated.
    Starting,
    /// Accepting deliveries.
    Ready,
    /// No new deliveries; in-flight ones are finishing.
    Draining,
    Stopped,
}

/// Coordinates startup gating and graceful shutdown.
///
/// 1. `Runtime::build` calls `set_ready()` after validation succeeds
/// 2. the dispatch pipeline checks `is_accepting()` per delivery
/// 3. `begin_shutdown()` moves to `Draining` and cancels the shutdown token
/// 4. `wait_for_drain()` waits until in-flight deliveries complete
///
/// Clones share state, so HTTP invokers can hold in-flight guards against the
/// runtime's controller.
#[derive(Debug, Clone)]
pub struct LifecycleController {
    shutdown: CancellationToken,
    in_flight: Arc<AtomicU64>,
    state: Arc<ArcSwap<LifecycleState>>,
}

impl LifecycleController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            in_flight: Arc::new(AtomicU64::new(0)),
            state: Arc::new(ArcSwap::from_pointee(LifecycleState::Starting)),
        }
    }

    pub fn set_ready(&self) {
        self.state.store(Arc::new(LifecycleState::Ready));
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    /// Shared handle to the state for middleware.
    #[must_use]
    pub fn state_handle(&self) -> Arc<ArcSwap<LifecycleState>> {
        Arc::clone(&self.state)
    }

    /// Token cancelled when shutdown begins. Dispatch loops derive their
    /// cancellation from it.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting deliveries and signal every dispatch loop.
    pub fn begin_shutdown(&self) {
        self.state.store(Arc::new(LifecycleState::Draining));
        self.shutdown.cancel();
    }

    /// Track one in-flight delivery until the guard drops.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Wait for in-flight deliveries to finish, up to `timeout`.
    ///
    /// Returns `true` and moves to `Stopped` when everything drained; returns
    /// `false` and stays `Draining` on timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.state.store(Arc::new(LifecycleState::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter on drop, including during unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
