//! Core circuit breaker implementation.

use std::error::Error;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{BreakerError, BreakerResult};
use crate::hook::HookRegistry;
use crate::policy::FailurePolicy;
use crate::schedule::{ExponentialBackoff, ResetSchedule};
use crate::state::{State, StateManager};

/// State shared between callers and the reset task. Free of the error type
/// so the task does not have to carry it.
struct BreakerCore<S>
where
    S: ResetSchedule,
{
    state: StateManager,
    failure_count: AtomicU32,
    max_failures: u32,
    schedule: Mutex<S>,
    reset_tx: mpsc::Sender<()>,
    hooks: Arc<HookRegistry>,
    clock: Arc<dyn Clock>,
}

/// A three-state circuit breaker for async operations.
///
/// The breaker trips open after `max_failures` consecutive counted failures,
/// rejects calls while open, and probes recovery with a single call once the
/// current reset delay has elapsed. Delays come from a [`ResetSchedule`] that
/// grows on every re-trip and rewinds when the circuit closes.
///
/// The failure cap is a post-hoc threshold, not a reservation: calls already
/// in flight when the threshold is crossed may still fail afterwards, and
/// those failures do not re-open an already-open breaker.
///
/// Dropping the breaker cancels its background reset task; share it by
/// wrapping it in an [`Arc`].
pub struct CircuitBreaker<E, S = ExponentialBackoff>
where
    E: Error + 'static,
    S: ResetSchedule,
{
    core: Arc<BreakerCore<S>>,
    failure_policy: Arc<dyn FailurePolicy<E>>,
    reset_task: JoinHandle<()>,
}

impl<E> CircuitBreaker<E>
where
    E: Error + 'static,
{
    /// Creates a builder with the default exponential reset schedule.
    pub fn builder() -> crate::config::BreakerBuilder<E> {
        crate::config::BreakerBuilder::new()
    }
}

impl<E, S> CircuitBreaker<E, S>
where
    E: Error + 'static,
    S: ResetSchedule,
{
    /// Must be called within a Tokio runtime: spawns the reset task.
    pub(crate) fn from_parts(
        max_failures: u32,
        schedule: S,
        hooks: Arc<HookRegistry>,
        failure_policy: Arc<dyn FailurePolicy<E>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (reset_tx, reset_rx) = mpsc::channel(1);
        let core = Arc::new(BreakerCore {
            state: StateManager::new(),
            failure_count: AtomicU32::new(0),
            max_failures,
            schedule: Mutex::new(schedule),
            reset_tx,
            hooks,
            clock,
        });
        let reset_task = tokio::spawn(run_reset_task(Arc::clone(&core), reset_rx));

        Self {
            core,
            failure_policy,
            reset_task,
        }
    }

    /// Current state of the circuit.
    pub fn current_state(&self) -> State {
        self.core.state.current()
    }

    /// Executes `op` under the breaker.
    ///
    /// In `Closed` the operation always runs; in `Open` the call fails fast
    /// with [`BreakerError::Open`]; in `HalfOpen` a single probe is admitted
    /// and everyone else fails fast.
    pub async fn call<F, Fut, T>(&self, op: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.core.state.current() {
            State::Closed => self.call_closed(op).await,
            State::Open => Err(BreakerError::Open),
            State::HalfOpen => {
                if self.core.state.try_acquire_probe() {
                    self.call_probe(op).await
                } else {
                    Err(BreakerError::Open)
                }
            }
        }
    }

    async fn call_closed<F, Fut, T>(&self, op: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match op().await {
            Ok(value) => {
                self.core.failure_count.store(0, Ordering::Release);
                self.core.hooks.fire_success();
                Ok(value)
            }
            Err(error) => {
                if self.failure_policy.is_failure(&error) {
                    self.record_failure();
                }
                self.core.hooks.fire_failure();
                Err(BreakerError::Operation(error))
            }
        }
    }

    async fn call_probe<F, Fut, T>(&self, op: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        // Re-arm the gate if this future is dropped before the probe reaches
        // an outcome, so the half-open state cannot wedge.
        let mut gate = ProbeGate {
            state: &self.core.state,
            armed: true,
        };
        let result = op().await;
        gate.armed = false;

        match result {
            Ok(value) => {
                self.close_from_probe();
                self.core.hooks.fire_success();
                Ok(value)
            }
            Err(error) => {
                // Any probe error re-opens; the failure policy scopes only
                // the closed-state count.
                if self.core.state.transition(State::HalfOpen, State::Open) {
                    warn!("circuit breaker re-opened: probe failed");
                    self.request_reset();
                    self.core.hooks.fire_transition(State::Open);
                }
                self.core.hooks.fire_failure();
                Err(BreakerError::Operation(error))
            }
        }
    }

    fn close_from_probe(&self) {
        if self.core.state.transition(State::HalfOpen, State::Closed) {
            self.core.failure_count.store(0, Ordering::Release);
            self.core.schedule.lock().reset();
            info!("circuit breaker closed: probe succeeded");
            self.core.hooks.fire_transition(State::Closed);
        }
    }

    /// Counts a failure; the caller that reaches the threshold and wins the
    /// `Closed → Open` race performs the trip.
    fn record_failure(&self) {
        let max = self.core.max_failures;
        let reached_max = self
            .core
            .failure_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < max).then_some(count + 1)
            })
            .map(|previous| previous + 1 == max)
            .unwrap_or(false);

        if reached_max && self.core.state.transition(State::Closed, State::Open) {
            warn!(max_failures = max, "circuit breaker opened");
            self.request_reset();
            self.core.hooks.fire_transition(State::Open);
        }
    }

    /// Posts one reset request; dropped if one is already pending.
    fn request_reset(&self) {
        let _ = self.core.reset_tx.try_send(());
    }

    /// Forces the circuit open. Returns false if it was already open.
    ///
    /// Behaves like an organic trip: a reset request is posted and the
    /// breaker will probe recovery on its schedule.
    pub fn force_open(&self) -> bool {
        let current = self.core.state.current();
        if current == State::Open {
            return false;
        }
        if self.core.state.transition(current, State::Open) {
            self.request_reset();
            self.core.hooks.fire_transition(State::Open);
            true
        } else {
            false
        }
    }

    /// Forces the circuit closed, resetting the failure count and the reset
    /// schedule. Returns false if it was already closed.
    pub fn force_closed(&self) -> bool {
        let current = self.core.state.current();
        if current == State::Closed {
            return false;
        }
        if self.core.state.transition(current, State::Closed) {
            self.core.failure_count.store(0, Ordering::Release);
            self.core.schedule.lock().reset();
            self.core.hooks.fire_transition(State::Closed);
            true
        } else {
            false
        }
    }
}

impl<E, S> Drop for CircuitBreaker<E, S>
where
    E: Error + 'static,
    S: ResetSchedule,
{
    fn drop(&mut self) {
        self.reset_task.abort();
    }
}

/// Consumes reset requests: advance the schedule, sleep the delay, then arm
/// the half-open probe.
async fn run_reset_task<S>(core: Arc<BreakerCore<S>>, mut reset_rx: mpsc::Receiver<()>)
where
    S: ResetSchedule,
{
    while reset_rx.recv().await.is_some() {
        // Advance the cursor under the lock, sleep outside it.
        let delay = core.schedule.lock().next_delay();
        debug!(?delay, "circuit breaker reset scheduled");
        core.clock.sleep(delay).await;

        // The CAS loses only if the breaker was forced closed meanwhile, in
        // which case no probe is due.
        if core.state.open_to_half_open() {
            info!("circuit breaker half-open: probing recovery");
            core.hooks.fire_transition(State::HalfOpen);
        }
    }
}

struct ProbeGate<'a> {
    state: &'a StateManager,
    armed: bool,
}

impl Drop for ProbeGate<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.release_probe();
        }
    }
}
