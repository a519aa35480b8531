//! Validated builders for the three policies.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use crate::breaker::CircuitBreaker;
use crate::bulkhead::Bulkhead;
use crate::clock::{Clock, TokioClock};
use crate::error::ConfigError;
use crate::hook::HookRegistry;
use crate::limiter::RateLimiter;
use crate::policy::{AllErrors, FailurePolicy};
use crate::schedule::{ExponentialBackoff, ResetSchedule};

/// Builder for [`CircuitBreaker`].
///
/// Defaults: 10 consecutive failures to trip, exponential reset schedule
/// starting at 1 s with factor 2, every error counted as a failure.
pub struct BreakerBuilder<E, S = ExponentialBackoff>
where
    E: Error + 'static,
    S: ResetSchedule,
{
    max_failures: u32,
    schedule: S,
    hooks: Arc<HookRegistry>,
    failure_policy: Arc<dyn FailurePolicy<E>>,
    clock: Arc<dyn Clock>,
}

impl<E> BreakerBuilder<E>
where
    E: Error + 'static,
{
    /// Builder with default settings.
    pub fn new() -> Self {
        Self {
            max_failures: 10,
            schedule: ExponentialBackoff::new(Duration::from_secs(1), 2.0),
            hooks: Arc::new(HookRegistry::new()),
            failure_policy: Arc::new(AllErrors),
            clock: Arc::new(TokioClock),
        }
    }
}

impl<E> Default for BreakerBuilder<E>
where
    E: Error + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E, S> BreakerBuilder<E, S>
where
    E: Error + 'static,
    S: ResetSchedule,
{
    /// Consecutive counted failures that trip the circuit. Must be ≥ 1.
    pub fn max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    /// Replaces the reset schedule.
    pub fn schedule<S2>(self, schedule: S2) -> BreakerBuilder<E, S2>
    where
        S2: ResetSchedule,
    {
        BreakerBuilder {
            max_failures: self.max_failures,
            schedule,
            hooks: self.hooks,
            failure_policy: self.failure_policy,
            clock: self.clock,
        }
    }

    /// Installs observer hooks.
    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Installs a failure classification policy.
    pub fn failure_policy(mut self, policy: impl FailurePolicy<E>) -> Self {
        self.failure_policy = Arc::new(policy);
        self
    }

    /// Replaces the time source.
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Validates the configuration and spawns the breaker's reset task.
    ///
    /// Must be called within a Tokio runtime.
    pub fn build(self) -> Result<CircuitBreaker<E, S>, ConfigError> {
        if self.max_failures == 0 {
            return Err(ConfigError::new("max_failures must be at least 1"));
        }
        Ok(CircuitBreaker::from_parts(
            self.max_failures,
            self.schedule,
            self.hooks,
            self.failure_policy,
            self.clock,
        ))
    }
}

/// Builder for [`RateLimiter`].
///
/// Defaults: 10 permits per 1 s interval.
pub struct RateLimiterBuilder {
    max: usize,
    interval: Duration,
    clock: Arc<dyn Clock>,
}

impl RateLimiterBuilder {
    /// Builder with default settings.
    pub fn new() -> Self {
        Self {
            max: 10,
            interval: Duration::from_secs(1),
            clock: Arc::new(TokioClock),
        }
    }

    /// Permits issued per interval. Must be ≥ 1.
    pub fn max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    /// Width of the sliding window. Must be non-zero.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Replaces the time source.
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Validates the configuration and builds the limiter.
    pub fn build(self) -> Result<RateLimiter, ConfigError> {
        if self.max == 0 {
            return Err(ConfigError::new("max must be at least 1"));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::new("interval must be non-zero"));
        }
        Ok(RateLimiter::from_parts(self.max, self.interval, self.clock))
    }
}

impl Default for RateLimiterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`Bulkhead`].
///
/// Defaults: 10 in-flight, 10 queued.
pub struct BulkheadBuilder {
    max_in_flight: usize,
    max_queueing: usize,
}

impl BulkheadBuilder {
    /// Builder with default settings.
    pub fn new() -> Self {
        Self {
            max_in_flight: 10,
            max_queueing: 10,
        }
    }

    /// Concurrent executions allowed. Must be ≥ 1.
    pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Callers allowed to wait for an in-flight slot. May be 0.
    pub fn max_queueing(mut self, max_queueing: usize) -> Self {
        self.max_queueing = max_queueing;
        self
    }

    /// Validates the configuration and builds the bulkhead.
    pub fn build(self) -> Result<Bulkhead, ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::new("max_in_flight must be at least 1"));
        }
        Ok(Bulkhead::from_parts(self.max_in_flight, self.max_queueing))
    }
}

impl Default for BulkheadBuilder {
    fn default() -> Self {
        Self::new()
    }
}
