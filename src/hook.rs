//! Hook registry for circuit breaker events.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::state::State;

type HookFn = Arc<dyn Fn() + Send + Sync + 'static>;

/// Observer callbacks for breaker state transitions and call outcomes.
///
/// Hooks are informational: the breaker fires them after the state mutation,
/// outside any lock, and never depends on their behaviour. A hook that calls
/// back into the breaker is safe.
pub struct HookRegistry {
    on_open: RwLock<Option<HookFn>>,
    on_close: RwLock<Option<HookFn>>,
    on_half_open: RwLock<Option<HookFn>>,
    on_success: RwLock<Option<HookFn>>,
    on_failure: RwLock<Option<HookFn>>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    /// Empty registry; every hook is a no-op until set.
    pub fn new() -> Self {
        Self {
            on_open: RwLock::new(None),
            on_close: RwLock::new(None),
            on_half_open: RwLock::new(None),
            on_success: RwLock::new(None),
            on_failure: RwLock::new(None),
        }
    }

    /// Called when the circuit trips open.
    pub fn set_on_open<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_open.write() = Some(Arc::new(hook));
    }

    /// Called when a successful probe closes the circuit.
    pub fn set_on_close<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_close.write() = Some(Arc::new(hook));
    }

    /// Called when the reset delay elapses and a probe is allowed.
    pub fn set_on_half_open<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_half_open.write() = Some(Arc::new(hook));
    }

    /// Called after every successful operation.
    pub fn set_on_success<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_success.write() = Some(Arc::new(hook));
    }

    /// Called after every failed operation.
    pub fn set_on_failure<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_failure.write() = Some(Arc::new(hook));
    }

    /// Fires the hook matching the state just entered.
    pub(crate) fn fire_transition(&self, to: State) {
        let slot = match to {
            State::Open => &self.on_open,
            State::Closed => &self.on_close,
            State::HalfOpen => &self.on_half_open,
        };
        Self::fire(slot);
    }

    pub(crate) fn fire_success(&self) {
        Self::fire(&self.on_success);
    }

    pub(crate) fn fire_failure(&self) {
        Self::fire(&self.on_failure);
    }

    fn fire(slot: &RwLock<Option<HookFn>>) {
        // Clone out of the lock so a hook that re-enters the registry
        // cannot deadlock.
        let hook = slot.read().clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}
