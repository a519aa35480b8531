//! Bounded-concurrency bulkhead with a bounded FIFO queue.

use std::error::Error;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{BulkheadError, BulkheadResult};

struct BulkheadShared {
    max_in_flight: usize,
    max_queueing: usize,
    // Two-stage admission: a slot in `slots` (in-flight + queue capacity)
    // is claimed without waiting or the call is rejected; the `in_flight`
    // semaphore then gates actual execution in FIFO order. Both permits
    // are RAII, so every termination — success, failure or cancellation —
    // gives its capacity back.
    slots: Semaphore,
    in_flight: Semaphore,
}

/// Limits in-flight calls to `max_in_flight` and queues at most
/// `max_queueing` more; anything beyond that is rejected immediately.
///
/// Queued callers are admitted in FIFO order of submission. Cancelling a
/// queued caller vacates its slot without ever counting as in-flight.
///
/// Cloning is cheap and clones share the same capacity.
pub struct Bulkhead {
    shared: Arc<BulkheadShared>,
}

impl Bulkhead {
    /// Creates a builder.
    pub fn builder() -> crate::config::BulkheadBuilder {
        crate::config::BulkheadBuilder::new()
    }

    pub(crate) fn from_parts(max_in_flight: usize, max_queueing: usize) -> Self {
        Self {
            shared: Arc::new(BulkheadShared {
                max_in_flight,
                max_queueing,
                slots: Semaphore::new(max_in_flight + max_queueing),
                in_flight: Semaphore::new(max_in_flight),
            }),
        }
    }

    /// Runs `op` when capacity allows.
    ///
    /// Fails fast with [`BulkheadError::Rejected`] when the queue is full;
    /// otherwise waits for an in-flight slot and runs the operation to
    /// completion.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> BulkheadResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        let shared = &self.shared;

        let _slot = match shared.slots.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(
                    max_in_flight = shared.max_in_flight,
                    max_queueing = shared.max_queueing,
                    "bulkhead rejected call"
                );
                return Err(BulkheadError::Rejected);
            }
        };

        // The semaphore is never closed; the error arm is unreachable but
        // mapped rather than unwrapped.
        let _permit = shared
            .in_flight
            .acquire()
            .await
            .map_err(|_| BulkheadError::Rejected)?;

        op().await.map_err(BulkheadError::Operation)
    }

    /// Number of calls currently executing.
    pub fn in_flight(&self) -> usize {
        self.shared.max_in_flight - self.shared.in_flight.available_permits()
    }

    /// Number of calls currently waiting for an in-flight slot.
    pub fn queued(&self) -> usize {
        let capacity = self.shared.max_in_flight + self.shared.max_queueing;
        let holders = capacity - self.shared.slots.available_permits();
        holders.saturating_sub(self.in_flight())
    }

    /// The configured in-flight limit.
    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight
    }

    /// The configured queue limit.
    pub fn max_queueing(&self) -> usize {
        self.shared.max_queueing
    }
}

impl Clone for Bulkhead {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("max_in_flight", &self.shared.max_in_flight)
            .field("max_queueing", &self.shared.max_queueing)
            .field("in_flight", &self.in_flight())
            .field("queued", &self.queued())
            .finish()
    }
}
