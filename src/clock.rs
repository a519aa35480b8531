//! Time capability consumed by the policies.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;

/// Monotonic time source with a cancellable sleep.
///
/// Policies never read the system clock directly; everything that sleeps or
/// stamps an instant goes through this trait so a test runtime can drive time
/// deterministically. Dropping the future returned by [`Clock::sleep`]
/// cancels the sleep.
pub trait Clock: Send + Sync + 'static {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Sleeps for `duration`. Cancellable by dropping the future.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Clock backed by the ambient Tokio runtime.
///
/// Under `tokio::time::pause` this clock follows the virtual time of the
/// runtime, which is how the timing-sensitive tests in this crate run without
/// real delays.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}
