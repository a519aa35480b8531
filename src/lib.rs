//! # resilience-rs
//!
//! Resilience policies for async Rust: a circuit breaker with scheduled
//! recovery probes, a sliding-window rate limiter, a queueing bulkhead, and
//! metered wrappers that aggregate windowed counters, latency histograms and
//! gauge samples.
//!
//! Policies wrap any `FnOnce() -> Future<Output = Result<T, E>>` and
//! preserve the caller's error type. All waiting is cancellable: dropping a
//! call future vacates its queue slot without leaking permits or in-flight
//! counts.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod breaker;
mod bulkhead;
mod clock;
mod config;
mod error;
mod histogram;
mod hook;
mod limiter;
mod metrics;
mod policy;
pub mod prelude;
mod schedule;
mod state;

// Re-exports
pub use breaker::CircuitBreaker;
pub use bulkhead::Bulkhead;
pub use clock::{Clock, TokioClock};
pub use config::{BreakerBuilder, BulkheadBuilder, RateLimiterBuilder};
pub use error::{BreakerError, BreakerResult, BulkheadError, BulkheadResult, ConfigError};
pub use histogram::{Histogram, HistogramSettings, HistogramSnapshot};
pub use hook::HookRegistry;
pub use limiter::RateLimiter;
pub use metrics::{
    BreakerMetrics, BulkheadMetrics, MeteredBulkhead, MeteredCircuitBreaker, MeteredRateLimiter,
    MetricsSink, RateLimiterMetrics,
};
pub use policy::{AllErrors, FailurePolicy, PredicatePolicy};
pub use schedule::{ExponentialBackoff, FixedBackoff, ResetSchedule};
pub use state::State;
