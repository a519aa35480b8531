//! Sliding-window rate limiter.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::clock::Clock;

struct LimiterShared {
    max: usize,
    interval: Duration,
    // Issuance stamps of the most recent `max` permits. The tokio mutex
    // hands the lock to waiters in FIFO order, which is what makes
    // admission fair; a waiter cancelled while queued or while pacing
    // simply vacates without stamping.
    issued: tokio::sync::Mutex<VecDeque<Instant>>,
    clock: Arc<dyn Clock>,
}

/// Paces calls to at most `max` admissions per sliding `interval`.
///
/// Excess callers wait — the limiter never rejects and never touches the
/// operation's error type. Admission is FIFO over submission order.
///
/// Cloning is cheap and clones share the same window.
pub struct RateLimiter {
    shared: Arc<LimiterShared>,
}

impl RateLimiter {
    /// Creates a builder.
    pub fn builder() -> crate::config::RateLimiterBuilder {
        crate::config::RateLimiterBuilder::new()
    }

    pub(crate) fn from_parts(max: usize, interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(LimiterShared {
                max,
                interval,
                issued: tokio::sync::Mutex::new(VecDeque::with_capacity(max)),
                clock,
            }),
        }
    }

    /// Runs `op` once a permit is available, passing its result through
    /// unchanged.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.acquire().await;
        op().await
    }

    /// Waits until issuing one more permit keeps the rolling window within
    /// `max`, then records the issuance.
    async fn acquire(&self) {
        let shared = &self.shared;
        let mut issued = shared.issued.lock().await;
        loop {
            let now = shared.clock.now();
            if issued.len() < shared.max {
                issued.push_back(now);
                return;
            }

            // Ring is full: the oldest stamp ages out of the window first.
            let oldest = issued[0];
            let ready_at = oldest + shared.interval;
            if ready_at <= now {
                issued.pop_front();
                issued.push_back(now);
                return;
            }

            let wait = ready_at - now;
            debug!(?wait, "rate limiter pacing");
            shared.clock.sleep(wait).await;
        }
    }

    /// The configured permit count per interval.
    pub fn max(&self) -> usize {
        self.shared.max
    }

    /// The configured window width.
    pub fn interval(&self) -> Duration {
        self.shared.interval
    }
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max", &self.shared.max)
            .field("interval", &self.shared.interval)
            .finish()
    }
}
