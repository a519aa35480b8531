//! Reset schedules: the delay sequence between a trip and its recovery probe.

use std::time::Duration;

/// A stateful sequence of delays consumed by the breaker's reset task.
///
/// Each call to [`next_delay`](ResetSchedule::next_delay) advances the cursor
/// one step; [`reset`](ResetSchedule::reset) rewinds it to the initial state,
/// which the breaker does when a probe succeeds and the circuit closes.
pub trait ResetSchedule: Send + 'static {
    /// Advances the cursor and returns the delay before the next probe.
    fn next_delay(&mut self) -> Duration;

    /// Rewinds the cursor so the next trip starts from the base delay.
    fn reset(&mut self);
}

/// Exponentially growing delays: `base`, `base * factor`, `base * factor²`, …
///
/// Growth is capped at [`with_max`](ExponentialBackoff::with_max) when set.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    factor: f64,
    max: Duration,
    next: Duration,
}

impl ExponentialBackoff {
    /// Schedule starting at `base` and multiplying by `factor` per step.
    pub fn new(base: Duration, factor: f64) -> Self {
        Self {
            base,
            factor,
            max: Duration::MAX,
            next: base,
        }
    }

    /// Caps the delay at `max`.
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self.next = self.next.min(max);
        self
    }
}

impl ResetSchedule for ExponentialBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        let scaled = self.next.as_secs_f64() * self.factor;
        self.next = if scaled >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(scaled)
        };
        delay
    }

    fn reset(&mut self) {
        self.next = self.base.min(self.max);
    }
}

/// Constant delay between every trip and its probe.
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    /// Schedule that always yields `delay`.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ResetSchedule for FixedBackoff {
    fn next_delay(&mut self) -> Duration {
        self.delay
    }

    fn reset(&mut self) {}
}
