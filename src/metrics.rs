//! Windowed metrics: addable snapshots, aggregators and metered wrappers.

use std::error::Error;
use std::future::Future;
use std::ops::Add;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::breaker::CircuitBreaker;
use crate::bulkhead::Bulkhead;
use crate::clock::{Clock, TokioClock};
use crate::error::{BreakerError, BreakerResult, BulkheadError, BulkheadResult};
use crate::histogram::{Histogram, HistogramSettings, HistogramSnapshot};
use crate::limiter::RateLimiter;
use crate::schedule::{ExponentialBackoff, ResetSchedule};

/// Receives the snapshot emitted at the end of each metrics interval.
///
/// Implemented for any `Fn(S)` closure. Sinks are informational; the
/// wrappers never depend on their behaviour.
pub trait MetricsSink<S>: Send + Sync + 'static {
    /// Delivers one snapshot.
    fn record(&self, snapshot: S);
}

impl<S, F> MetricsSink<S> for F
where
    F: Fn(S) + Send + Sync + 'static,
{
    fn record(&self, snapshot: S) {
        self(snapshot)
    }
}

/// Counters observed over one interval of a metered circuit breaker.
///
/// Snapshots are addable: intervals sum and counters add, so a stream of
/// snapshots folds into a cumulative view with `+`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakerMetrics {
    /// Wall time covered by this snapshot.
    pub interval: Duration,
    /// Calls submitted to the breaker.
    pub calls: u64,
    /// Calls that ran and succeeded.
    pub successes: u64,
    /// Calls that ran and failed.
    pub failures: u64,
    /// Calls rejected because the circuit was open.
    pub rejections: u64,
}

impl Add for BreakerMetrics {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self.interval += rhs.interval;
        self.calls += rhs.calls;
        self.successes += rhs.successes;
        self.failures += rhs.failures;
        self.rejections += rhs.rejections;
        self
    }
}

/// Counters and queue latencies over one interval of a metered rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterMetrics {
    /// Wall time covered by this snapshot.
    pub interval: Duration,
    /// Calls submitted to the limiter.
    pub tasks_enqueued: u64,
    /// Calls admitted and started.
    pub tasks_started: u64,
    /// Calls cancelled while still waiting for a permit.
    pub tasks_interrupted: u64,
    /// Enqueue-to-start latency, in nanoseconds.
    pub queue_latency: HistogramSnapshot,
}

impl Add for RateLimiterMetrics {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self.interval += rhs.interval;
        self.tasks_enqueued += rhs.tasks_enqueued;
        self.tasks_started += rhs.tasks_started;
        self.tasks_interrupted += rhs.tasks_interrupted;
        self.queue_latency = self.queue_latency.merge(&rhs.queue_latency);
        self
    }
}

/// Counters, queue latencies and gauge samples over one interval of a
/// metered bulkhead.
#[derive(Debug, Clone)]
pub struct BulkheadMetrics {
    /// Wall time covered by this snapshot.
    pub interval: Duration,
    /// Calls submitted to the bulkhead, including later-rejected ones.
    pub tasks_enqueued: u64,
    /// Calls admitted and started.
    pub tasks_started: u64,
    /// Started calls that terminated, by any outcome.
    pub tasks_completed: u64,
    /// Calls cancelled while still queued.
    pub tasks_interrupted: u64,
    /// Calls rejected because the queue was full.
    pub tasks_rejected: u64,
    /// Enqueue-to-start latency, in nanoseconds.
    pub queue_latency: HistogramSnapshot,
    /// Sampled in-flight gauge.
    pub in_flight: HistogramSnapshot,
    /// Sampled queue-depth gauge.
    pub queued: HistogramSnapshot,
}

impl Add for BulkheadMetrics {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self.interval += rhs.interval;
        self.tasks_enqueued += rhs.tasks_enqueued;
        self.tasks_started += rhs.tasks_started;
        self.tasks_completed += rhs.tasks_completed;
        self.tasks_interrupted += rhs.tasks_interrupted;
        self.tasks_rejected += rhs.tasks_rejected;
        self.queue_latency = self.queue_latency.merge(&rhs.queue_latency);
        self.in_flight = self.in_flight.merge(&rhs.in_flight);
        self.queued = self.queued.merge(&rhs.queued);
        self
    }
}

struct BreakerAggregator {
    interval_start: Mutex<Instant>,
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl BreakerAggregator {
    fn new(now: Instant) -> Self {
        Self {
            interval_start: Mutex::new(now),
            calls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    fn flush(&self, now: Instant) -> BreakerMetrics {
        let interval = {
            let mut start = self.interval_start.lock();
            let elapsed = now.duration_since(*start);
            *start = now;
            elapsed
        };
        BreakerMetrics {
            interval,
            calls: self.calls.swap(0, Ordering::AcqRel),
            successes: self.successes.swap(0, Ordering::AcqRel),
            failures: self.failures.swap(0, Ordering::AcqRel),
            rejections: self.rejections.swap(0, Ordering::AcqRel),
        }
    }
}

struct LimiterAggregator {
    interval_start: Mutex<Instant>,
    tasks_enqueued: AtomicU64,
    tasks_started: AtomicU64,
    tasks_interrupted: AtomicU64,
    queue_latency: Histogram,
}

impl LimiterAggregator {
    fn new(now: Instant, latency: HistogramSettings) -> Self {
        Self {
            interval_start: Mutex::new(now),
            tasks_enqueued: AtomicU64::new(0),
            tasks_started: AtomicU64::new(0),
            tasks_interrupted: AtomicU64::new(0),
            queue_latency: Histogram::new(latency),
        }
    }

    fn flush(&self, now: Instant) -> RateLimiterMetrics {
        let interval = {
            let mut start = self.interval_start.lock();
            let elapsed = now.duration_since(*start);
            *start = now;
            elapsed
        };
        RateLimiterMetrics {
            interval,
            tasks_enqueued: self.tasks_enqueued.swap(0, Ordering::AcqRel),
            tasks_started: self.tasks_started.swap(0, Ordering::AcqRel),
            tasks_interrupted: self.tasks_interrupted.swap(0, Ordering::AcqRel),
            queue_latency: self.queue_latency.drain(),
        }
    }
}

struct BulkheadAggregator {
    interval_start: Mutex<Instant>,
    tasks_enqueued: AtomicU64,
    tasks_started: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_interrupted: AtomicU64,
    tasks_rejected: AtomicU64,
    queue_latency: Histogram,
    in_flight: Histogram,
    queued: Histogram,
}

impl BulkheadAggregator {
    fn new(now: Instant, latency: HistogramSettings, bulkhead: &Bulkhead) -> Self {
        let in_flight_range = bulkhead.max_in_flight() as u64;
        let queued_range = bulkhead.max_queueing().max(1) as u64;
        Self {
            interval_start: Mutex::new(now),
            tasks_enqueued: AtomicU64::new(0),
            tasks_started: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_interrupted: AtomicU64::new(0),
            tasks_rejected: AtomicU64::new(0),
            queue_latency: Histogram::new(latency),
            in_flight: Histogram::new(HistogramSettings::new(1, in_flight_range).bucket_count(16)),
            queued: Histogram::new(HistogramSettings::new(1, queued_range).bucket_count(16)),
        }
    }

    fn flush(&self, now: Instant) -> BulkheadMetrics {
        let interval = {
            let mut start = self.interval_start.lock();
            let elapsed = now.duration_since(*start);
            *start = now;
            elapsed
        };
        BulkheadMetrics {
            interval,
            tasks_enqueued: self.tasks_enqueued.swap(0, Ordering::AcqRel),
            tasks_started: self.tasks_started.swap(0, Ordering::AcqRel),
            tasks_completed: self.tasks_completed.swap(0, Ordering::AcqRel),
            tasks_interrupted: self.tasks_interrupted.swap(0, Ordering::AcqRel),
            tasks_rejected: self.tasks_rejected.swap(0, Ordering::AcqRel),
            queue_latency: self.queue_latency.drain(),
            in_flight: self.in_flight.drain(),
            queued: self.queued.drain(),
        }
    }
}

/// Circuit breaker wrapper that aggregates call counters and emits a
/// snapshot every `metrics_interval`, plus a final one on drop.
///
/// Construction spawns the flush task, so it must happen within a Tokio
/// runtime.
pub struct MeteredCircuitBreaker<E, S = ExponentialBackoff>
where
    E: Error + 'static,
    S: ResetSchedule,
{
    inner: CircuitBreaker<E, S>,
    aggregator: Arc<BreakerAggregator>,
    sink: Arc<dyn MetricsSink<BreakerMetrics>>,
    clock: Arc<dyn Clock>,
    flush_task: JoinHandle<()>,
}

impl<E, S> MeteredCircuitBreaker<E, S>
where
    E: Error + 'static,
    S: ResetSchedule,
{
    /// Wraps `inner`, flushing to `sink` every `metrics_interval`.
    pub fn new(
        inner: CircuitBreaker<E, S>,
        metrics_interval: Duration,
        sink: impl MetricsSink<BreakerMetrics>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let aggregator = Arc::new(BreakerAggregator::new(clock.now()));
        let sink: Arc<dyn MetricsSink<BreakerMetrics>> = Arc::new(sink);
        let flush_task = spawn_flush_task(metrics_interval, Arc::clone(&clock), {
            let aggregator = Arc::clone(&aggregator);
            let sink = Arc::clone(&sink);
            move |now| sink.record(aggregator.flush(now))
        });

        Self {
            inner,
            aggregator,
            sink,
            clock,
            flush_task,
        }
    }

    /// The wrapped breaker.
    pub fn inner(&self) -> &CircuitBreaker<E, S> {
        &self.inner
    }

    /// Delegates to [`CircuitBreaker::call`], counting the outcome.
    pub async fn call<F, Fut, T>(&self, op: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.aggregator.calls.fetch_add(1, Ordering::Relaxed);
        let result = self.inner.call(op).await;
        let counter = match &result {
            Ok(_) => &self.aggregator.successes,
            Err(BreakerError::Open) => &self.aggregator.rejections,
            Err(BreakerError::Operation(_)) => &self.aggregator.failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }
}

impl<E, S> Drop for MeteredCircuitBreaker<E, S>
where
    E: Error + 'static,
    S: ResetSchedule,
{
    fn drop(&mut self) {
        self.flush_task.abort();
        // Trailing partial interval.
        self.sink.record(self.aggregator.flush(self.clock.now()));
    }
}

/// Rate limiter wrapper that aggregates queue counters and latencies and
/// emits a snapshot every `metrics_interval`, plus a final one on drop.
///
/// Construction spawns the flush task, so it must happen within a Tokio
/// runtime.
pub struct MeteredRateLimiter {
    inner: RateLimiter,
    aggregator: Arc<LimiterAggregator>,
    sink: Arc<dyn MetricsSink<RateLimiterMetrics>>,
    clock: Arc<dyn Clock>,
    flush_task: JoinHandle<()>,
}

impl MeteredRateLimiter {
    /// Wraps `inner`, recording queue latencies against `latency` buckets
    /// and flushing to `sink` every `metrics_interval`.
    pub fn new(
        inner: RateLimiter,
        latency: HistogramSettings,
        metrics_interval: Duration,
        sink: impl MetricsSink<RateLimiterMetrics>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let aggregator = Arc::new(LimiterAggregator::new(clock.now(), latency));
        let sink: Arc<dyn MetricsSink<RateLimiterMetrics>> = Arc::new(sink);
        let flush_task = spawn_flush_task(metrics_interval, Arc::clone(&clock), {
            let aggregator = Arc::clone(&aggregator);
            let sink = Arc::clone(&sink);
            move |now| sink.record(aggregator.flush(now))
        });

        Self {
            inner,
            aggregator,
            sink,
            clock,
            flush_task,
        }
    }

    /// The wrapped limiter.
    pub fn inner(&self) -> &RateLimiter {
        &self.inner
    }

    /// Delegates to [`RateLimiter::call`], accounting for queueing.
    ///
    /// A caller cancelled before admission counts as interrupted, not
    /// started; one cancelled after admission has already been counted as
    /// started.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let aggregator = &self.aggregator;
        let clock = &self.clock;
        let enqueued_at = clock.now();
        aggregator.tasks_enqueued.fetch_add(1, Ordering::Relaxed);

        let admitted = AtomicBool::new(false);
        let _guard = InterruptGuard {
            interrupted: &aggregator.tasks_interrupted,
            admitted: &admitted,
        };

        self.inner
            .call(|| {
                admitted.store(true, Ordering::Release);
                aggregator.tasks_started.fetch_add(1, Ordering::Relaxed);
                aggregator
                    .queue_latency
                    .record(nanos(clock.now().duration_since(enqueued_at)));
                op()
            })
            .await
    }
}

impl Drop for MeteredRateLimiter {
    fn drop(&mut self) {
        self.flush_task.abort();
        self.sink.record(self.aggregator.flush(self.clock.now()));
    }
}

/// Bulkhead wrapper that aggregates queue counters, latencies and sampled
/// gauges, emitting a snapshot every `metrics_interval` plus a final one on
/// drop.
///
/// A background sampler records the in-flight and queued gauges every
/// `sample_interval`. Construction spawns both tasks, so it must happen
/// within a Tokio runtime.
pub struct MeteredBulkhead {
    inner: Bulkhead,
    aggregator: Arc<BulkheadAggregator>,
    sink: Arc<dyn MetricsSink<BulkheadMetrics>>,
    clock: Arc<dyn Clock>,
    flush_task: JoinHandle<()>,
    sampler_task: JoinHandle<()>,
}

impl MeteredBulkhead {
    /// Wraps `inner`, recording queue latencies against `latency` buckets,
    /// sampling gauges every `sample_interval` and flushing to `sink` every
    /// `metrics_interval`.
    pub fn new(
        inner: Bulkhead,
        latency: HistogramSettings,
        metrics_interval: Duration,
        sample_interval: Duration,
        sink: impl MetricsSink<BulkheadMetrics>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let aggregator = Arc::new(BulkheadAggregator::new(clock.now(), latency, &inner));
        let sink: Arc<dyn MetricsSink<BulkheadMetrics>> = Arc::new(sink);

        let flush_task = spawn_flush_task(metrics_interval, Arc::clone(&clock), {
            let aggregator = Arc::clone(&aggregator);
            let sink = Arc::clone(&sink);
            move |now| sink.record(aggregator.flush(now))
        });
        let sampler_task = tokio::spawn(run_sampler_task(
            sample_interval,
            Arc::clone(&clock),
            inner.clone(),
            Arc::clone(&aggregator),
        ));

        Self {
            inner,
            aggregator,
            sink,
            clock,
            flush_task,
            sampler_task,
        }
    }

    /// The wrapped bulkhead.
    pub fn inner(&self) -> &Bulkhead {
        &self.inner
    }

    /// Delegates to [`Bulkhead::call`], accounting for queueing.
    ///
    /// Rejected calls count as enqueued and rejected, never as interrupted.
    /// Started calls bump the completion counter on any termination,
    /// including cancellation mid-operation.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> BulkheadResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        let aggregator = &self.aggregator;
        let clock = &self.clock;
        let enqueued_at = clock.now();
        aggregator.tasks_enqueued.fetch_add(1, Ordering::Relaxed);

        let admitted = AtomicBool::new(false);
        let _guard = InterruptGuard {
            interrupted: &aggregator.tasks_interrupted,
            admitted: &admitted,
        };

        let result = self
            .inner
            .call(|| {
                admitted.store(true, Ordering::Release);
                aggregator.tasks_started.fetch_add(1, Ordering::Relaxed);
                aggregator
                    .queue_latency
                    .record(nanos(clock.now().duration_since(enqueued_at)));
                let completed = &aggregator.tasks_completed;
                async move {
                    let _completion = CompletionGuard { completed };
                    op().await
                }
            })
            .await;

        if matches!(&result, Err(BulkheadError::Rejected)) {
            // A rejection is not an interruption; disarm the guard.
            admitted.store(true, Ordering::Release);
            aggregator.tasks_rejected.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

impl Drop for MeteredBulkhead {
    fn drop(&mut self) {
        self.flush_task.abort();
        self.sampler_task.abort();
        self.sink.record(self.aggregator.flush(self.clock.now()));
    }
}

/// Counts an interruption when dropped before the call was admitted (or
/// otherwise resolved).
struct InterruptGuard<'a> {
    interrupted: &'a AtomicU64,
    admitted: &'a AtomicBool,
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        if !self.admitted.load(Ordering::Acquire) {
            self.interrupted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Counts a completion when the started operation terminates, whatever the
/// outcome.
struct CompletionGuard<'a> {
    completed: &'a AtomicU64,
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }
}

fn spawn_flush_task<F>(every: Duration, clock: Arc<dyn Clock>, flush: F) -> JoinHandle<()>
where
    F: Fn(Instant) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            clock.sleep(every).await;
            flush(clock.now());
        }
    })
}

async fn run_sampler_task(
    every: Duration,
    clock: Arc<dyn Clock>,
    bulkhead: Bulkhead,
    aggregator: Arc<BulkheadAggregator>,
) {
    loop {
        clock.sleep(every).await;
        aggregator.in_flight.record(bulkhead.in_flight() as u64);
        aggregator.queued.record(bulkhead.queued() as u64);
    }
}

fn nanos(duration: Duration) -> u64 {
    duration.as_nanos().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_metrics_add_componentwise() {
        let a = BreakerMetrics {
            interval: Duration::from_secs(1),
            calls: 10,
            successes: 7,
            failures: 2,
            rejections: 1,
        };
        let b = BreakerMetrics {
            interval: Duration::from_millis(500),
            calls: 4,
            successes: 4,
            failures: 0,
            rejections: 0,
        };

        let sum = a + b;
        assert_eq!(sum.interval, Duration::from_millis(1500));
        assert_eq!(sum.calls, 14);
        assert_eq!(sum.successes, 11);
        assert_eq!(sum.failures, 2);
        assert_eq!(sum.rejections, 1);
    }

    #[test]
    fn limiter_metrics_add_is_commutative_on_counters() {
        let settings = HistogramSettings::new(1, 1_000_000_000);
        let histogram = Histogram::new(settings);
        histogram.record(100);
        let a = RateLimiterMetrics {
            interval: Duration::from_secs(1),
            tasks_enqueued: 5,
            tasks_started: 5,
            tasks_interrupted: 0,
            queue_latency: histogram.drain(),
        };
        histogram.record(200);
        histogram.record(300);
        let b = RateLimiterMetrics {
            interval: Duration::from_secs(2),
            tasks_enqueued: 3,
            tasks_started: 2,
            tasks_interrupted: 1,
            queue_latency: histogram.drain(),
        };

        let ab = a.clone() + b.clone();
        let ba = b + a;
        assert_eq!(ab.interval, ba.interval);
        assert_eq!(ab.tasks_enqueued, ba.tasks_enqueued);
        assert_eq!(ab.tasks_started, ba.tasks_started);
        assert_eq!(ab.tasks_interrupted, ba.tasks_interrupted);
        assert_eq!(ab.queue_latency.count(), 3);
        assert_eq!(ba.queue_latency.count(), 3);
    }
}
