//! Circuit breaker state machine.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// The three states of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Operations are allowed; failures are being counted.
    Closed = 0,

    /// Operations are rejected until the reset delay elapses.
    Open = 1,

    /// Exactly one probe operation is allowed through.
    HalfOpen = 2,
}

impl From<u8> for State {
    fn from(value: u8) -> Self {
        match value {
            1 => State::Open,
            2 => State::HalfOpen,
            _ => State::Closed,
        }
    }
}

/// Atomic state cell plus the half-open probe gate.
///
/// Every transition is a single compare-exchange, so each transition observes
/// exactly one predecessor state and concurrent attempts collapse to one
/// winner. The gate authorises the single probe call in `HalfOpen`; the
/// invariant `Closed ⇒ gate set` holds because entering `Closed` re-arms it.
pub(crate) struct StateManager {
    state: AtomicU8,
    half_open_gate: AtomicBool,
}

impl StateManager {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(State::Closed as u8),
            half_open_gate: AtomicBool::new(true),
        }
    }

    /// Current state.
    pub(crate) fn current(&self) -> State {
        State::from(self.state.load(Ordering::Acquire))
    }

    /// Attempts the transition `from → to`; true if this caller performed it.
    pub(crate) fn transition(&self, from: State, to: State) -> bool {
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if swapped && to == State::Closed {
            self.half_open_gate.store(true, Ordering::Release);
        }

        swapped
    }

    /// Arms the probe gate and moves `Open → HalfOpen`.
    ///
    /// The gate is armed first so a caller that observes `HalfOpen` always
    /// finds the gate set; a stale armed gate in `Open` is harmless because
    /// open-state callers are rejected before they reach it.
    pub(crate) fn open_to_half_open(&self) -> bool {
        self.half_open_gate.store(true, Ordering::Release);
        self.transition(State::Open, State::HalfOpen)
    }

    /// Test-and-clear of the probe gate. True means this caller holds the
    /// one probe slot.
    pub(crate) fn try_acquire_probe(&self) -> bool {
        self.half_open_gate.swap(false, Ordering::AcqRel)
    }

    /// Re-arms the gate after a probe was admitted but never reached an
    /// outcome (the probe future was dropped).
    pub(crate) fn release_probe(&self) {
        self.half_open_gate.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_requires_expected_predecessor() {
        let manager = StateManager::new();
        assert!(!manager.transition(State::Open, State::HalfOpen));
        assert!(manager.transition(State::Closed, State::Open));
        assert_eq!(manager.current(), State::Open);
        assert!(!manager.transition(State::Closed, State::Open));
    }

    #[test]
    fn probe_gate_admits_exactly_once() {
        let manager = StateManager::new();
        manager.transition(State::Closed, State::Open);
        manager.open_to_half_open();
        assert!(manager.try_acquire_probe());
        assert!(!manager.try_acquire_probe());
    }

    #[test]
    fn closing_rearms_the_gate() {
        let manager = StateManager::new();
        manager.transition(State::Closed, State::Open);
        manager.open_to_half_open();
        assert!(manager.try_acquire_probe());
        manager.transition(State::HalfOpen, State::Closed);
        manager.transition(State::Closed, State::Open);
        manager.open_to_half_open();
        assert!(manager.try_acquire_probe());
    }
}
