use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use resilience_rs::{
    Bulkhead, BulkheadError, BulkheadMetrics, BreakerError, CircuitBreaker, ExponentialBackoff,
    HistogramSettings, HookRegistry, MeteredBulkhead, MeteredCircuitBreaker, MeteredRateLimiter,
    PredicatePolicy, RateLimiter, RateLimiterMetrics, State,
};
use tokio::time::{advance, Instant};

// Custom error type that implements Error trait
#[derive(Debug)]
struct TestError(String);

impl TestError {
    fn new(msg: &str) -> Self {
        TestError(msg.to_string())
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Test error: {}", self.0)
    }
}

impl Error for TestError {}

/// Yields enough times for background tasks to observe pending work.
async fn settle() {
    for _ in 0..25 {
        tokio::task::yield_now().await;
    }
}

async fn fail(breaker: &CircuitBreaker<TestError>) {
    let result = breaker
        .call(|| async { Err::<(), _>(TestError::new("boom")) })
        .await;
    assert!(matches!(result, Err(BreakerError::Operation(_))));
}

async fn succeed(breaker: &CircuitBreaker<TestError>) {
    let result = breaker
        .call(|| async { Ok::<_, TestError>("ok") })
        .await;
    assert!(result.is_ok());
}

#[tokio::test(start_paused = true)]
async fn breaker_trips_after_max_consecutive_failures() {
    let breaker = CircuitBreaker::<TestError>::builder()
        .max_failures(10)
        .schedule(ExponentialBackoff::new(Duration::from_secs(1), 2.0))
        .build()
        .unwrap();

    for _ in 0..10 {
        fail(&breaker).await;
    }
    assert_eq!(breaker.current_state(), State::Open);

    // The eleventh call is rejected without running.
    let result = breaker
        .call(|| async { Ok::<_, TestError>("never runs") })
        .await;
    assert!(matches!(result, Err(BreakerError::Open)));
}

#[tokio::test(start_paused = true)]
async fn breaker_success_in_closed_resets_the_count() {
    let breaker = CircuitBreaker::<TestError>::builder()
        .max_failures(3)
        .build()
        .unwrap();

    fail(&breaker).await;
    fail(&breaker).await;
    succeed(&breaker).await;
    fail(&breaker).await;
    fail(&breaker).await;
    assert_eq!(breaker.current_state(), State::Closed);
    fail(&breaker).await;
    assert_eq!(breaker.current_state(), State::Open);
}

#[tokio::test(start_paused = true)]
async fn breaker_probes_and_closes_with_ordered_state_changes() {
    let transitions: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let hooks = HookRegistry::new();
    {
        let log = Arc::clone(&transitions);
        hooks.set_on_open(move || log.lock().unwrap().push("open"));
    }
    {
        let log = Arc::clone(&transitions);
        hooks.set_on_half_open(move || log.lock().unwrap().push("half-open"));
    }
    {
        let log = Arc::clone(&transitions);
        hooks.set_on_close(move || log.lock().unwrap().push("closed"));
    }

    let breaker = CircuitBreaker::<TestError>::builder()
        .max_failures(1)
        .schedule(ExponentialBackoff::new(Duration::from_secs(1), 2.0))
        .hooks(hooks)
        .build()
        .unwrap();

    fail(&breaker).await;
    assert_eq!(breaker.current_state(), State::Open);

    settle().await;
    advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(breaker.current_state(), State::HalfOpen);

    succeed(&breaker).await;
    assert_eq!(breaker.current_state(), State::Closed);
    assert_eq!(*transitions.lock().unwrap(), vec!["open", "half-open", "closed"]);
}

#[tokio::test(start_paused = true)]
async fn breaker_backoff_doubles_and_resets_on_close() {
    let breaker = CircuitBreaker::<TestError>::builder()
        .max_failures(3)
        .schedule(ExponentialBackoff::new(Duration::from_secs(1), 2.0))
        .build()
        .unwrap();

    for _ in 0..3 {
        fail(&breaker).await;
    }
    assert_eq!(breaker.current_state(), State::Open);

    settle().await;
    advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(breaker.current_state(), State::HalfOpen);

    // Failed probe re-opens; the next delay has doubled to 2 s.
    fail(&breaker).await;
    assert_eq!(breaker.current_state(), State::Open);

    settle().await;
    advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(breaker.current_state(), State::Open);

    advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(breaker.current_state(), State::HalfOpen);

    succeed(&breaker).await;
    assert_eq!(breaker.current_state(), State::Closed);

    // Closing rewound the schedule: a new trip probes after 1 s again.
    for _ in 0..3 {
        fail(&breaker).await;
    }
    assert_eq!(breaker.current_state(), State::Open);
    settle().await;
    advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(breaker.current_state(), State::HalfOpen);
}

#[tokio::test(start_paused = true)]
async fn breaker_admits_exactly_one_probe() {
    let breaker = Arc::new(
        CircuitBreaker::<TestError>::builder()
            .max_failures(1)
            .schedule(ExponentialBackoff::new(Duration::from_secs(1), 2.0))
            .build()
            .unwrap(),
    );

    fail(&breaker).await;
    settle().await;
    advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(breaker.current_state(), State::HalfOpen);

    // The probe holds the gate while it runs.
    let probe = {
        let breaker = Arc::clone(&breaker);
        tokio::spawn(async move {
            breaker
                .call(|| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, TestError>("recovered")
                })
                .await
        })
    };
    settle().await;

    let result = breaker
        .call(|| async { Ok::<_, TestError>("second probe") })
        .await;
    assert!(matches!(result, Err(BreakerError::Open)));

    advance(Duration::from_millis(100)).await;
    assert!(probe.await.unwrap().is_ok());
    assert_eq!(breaker.current_state(), State::Closed);
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_exactly_once_under_parallel_failures() {
    let opened = Arc::new(AtomicU32::new(0));
    let hooks = HookRegistry::new();
    {
        let opened = Arc::clone(&opened);
        hooks.set_on_open(move || {
            opened.fetch_add(1, Ordering::SeqCst);
        });
    }

    let breaker = Arc::new(
        CircuitBreaker::<TestError>::builder()
            .max_failures(2)
            .hooks(hooks)
            .build()
            .unwrap(),
    );

    let mut handles = Vec::new();
    for _ in 0..10 {
        let breaker = Arc::clone(&breaker);
        handles.push(tokio::spawn(async move {
            let _ = breaker
                .call(|| async { Err::<(), _>(TestError::new("parallel")) })
                .await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(breaker.current_state(), State::Open);
    assert_eq!(opened.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn breaker_failure_policy_filters_errors() {
    let breaker = CircuitBreaker::<TestError>::builder()
        .max_failures(1)
        .failure_policy(PredicatePolicy::new(|e: &TestError| e.0 == "counts"))
        .build()
        .unwrap();

    // Errors the policy ignores surface to the caller but never trip.
    for _ in 0..5 {
        let result = breaker
            .call(|| async { Err::<(), _>(TestError::new("ignored")) })
            .await;
        assert!(matches!(result, Err(BreakerError::Operation(_))));
    }
    assert_eq!(breaker.current_state(), State::Closed);

    let _ = breaker
        .call(|| async { Err::<(), _>(TestError::new("counts")) })
        .await;
    assert_eq!(breaker.current_state(), State::Open);
}

#[tokio::test(start_paused = true)]
async fn breaker_probe_failure_reopens_even_when_not_counted() {
    let breaker = CircuitBreaker::<TestError>::builder()
        .max_failures(1)
        .schedule(ExponentialBackoff::new(Duration::from_secs(1), 2.0))
        .failure_policy(PredicatePolicy::new(|e: &TestError| e.0 == "counts"))
        .build()
        .unwrap();

    let _ = breaker
        .call(|| async { Err::<(), _>(TestError::new("counts")) })
        .await;
    assert_eq!(breaker.current_state(), State::Open);

    settle().await;
    advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(breaker.current_state(), State::HalfOpen);

    // The policy does not count this error, but any failed probe re-opens.
    let _ = breaker
        .call(|| async { Err::<(), _>(TestError::new("ignored")) })
        .await;
    assert_eq!(breaker.current_state(), State::Open);
}

#[tokio::test(start_paused = true)]
async fn breaker_manual_control() {
    let breaker = CircuitBreaker::<TestError>::builder().build().unwrap();

    assert!(breaker.force_open());
    assert_eq!(breaker.current_state(), State::Open);
    assert!(!breaker.force_open());

    let result = breaker
        .call(|| async { Ok::<_, TestError>("nope") })
        .await;
    assert!(matches!(result, Err(BreakerError::Open)));

    assert!(breaker.force_closed());
    assert_eq!(breaker.current_state(), State::Closed);
    assert!(!breaker.force_closed());
}

#[tokio::test(start_paused = true)]
async fn rate_limiter_spaces_permit_groups_by_interval() {
    let limiter = RateLimiter::builder()
        .max(5)
        .interval(Duration::from_secs(1))
        .build()
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            limiter
                .call(|| async { Ok::<_, TestError>(Instant::now()) })
                .await
                .unwrap()
        }));
    }

    let mut starts = Vec::new();
    for handle in handles {
        starts.push(handle.await.unwrap());
    }
    starts.sort();

    // In every rolling window of one second at most five ops started.
    for i in 5..starts.len() {
        assert!(
            starts[i].duration_since(starts[i - 5]) >= Duration::from_secs(1),
            "window violated at index {i}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn rate_limiter_passes_errors_through_unchanged() {
    let limiter = RateLimiter::builder().max(2).build().unwrap();

    let result: Result<(), TestError> = limiter
        .call(|| async { Err(TestError::new("untouched")) })
        .await;
    assert_eq!(result.unwrap_err().0, "untouched");
}

#[tokio::test(start_paused = true)]
async fn bulkhead_caps_in_flight_and_rejects_above_queue() {
    let bulkhead = Bulkhead::builder()
        .max_in_flight(2)
        .max_queueing(2)
        .build()
        .unwrap();

    let running = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let bulkhead = bulkhead.clone();
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            bulkhead
                .call(|| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, TestError>(())
                })
                .await
        }));
    }
    settle().await;

    // Slots are exhausted: two in flight, two queued.
    assert_eq!(bulkhead.in_flight(), 2);
    assert_eq!(bulkhead.queued(), 2);
    let rejected = bulkhead
        .call(|| async { Ok::<_, TestError>(()) })
        .await;
    assert!(matches!(rejected, Err(BulkheadError::Rejected)));

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(bulkhead.in_flight(), 0);
    assert_eq!(bulkhead.queued(), 0);
}

#[tokio::test(start_paused = true)]
async fn metered_bulkhead_accounts_for_interruption() {
    let snapshots: Arc<Mutex<Vec<BulkheadMetrics>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let snapshots = Arc::clone(&snapshots);
        move |snapshot: BulkheadMetrics| snapshots.lock().unwrap().push(snapshot)
    };

    let bulkhead = Bulkhead::builder()
        .max_in_flight(1)
        .max_queueing(1)
        .build()
        .unwrap();
    let metered = Arc::new(MeteredBulkhead::new(
        bulkhead,
        HistogramSettings::new(1_000, 10_000_000_000),
        Duration::from_secs(3600),
        Duration::from_secs(3600),
        sink,
    ));

    // A holds the only in-flight slot.
    let a = {
        let metered = Arc::clone(&metered);
        tokio::spawn(async move {
            metered
                .call(|| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, TestError>(())
                })
                .await
        })
    };
    settle().await;

    // B queues behind A, then is cancelled before admission.
    let b = {
        let metered = Arc::clone(&metered);
        tokio::spawn(async move {
            metered
                .call(|| async { Ok::<_, TestError>(()) })
                .await
        })
    };
    settle().await;
    b.abort();
    settle().await;

    advance(Duration::from_millis(50)).await;
    assert!(a.await.unwrap().is_ok());

    let metered = Arc::try_unwrap(metered)
        .map_err(|_| "metered bulkhead still shared")
        .unwrap();
    drop(metered);

    let total = snapshots
        .lock()
        .unwrap()
        .drain(..)
        .reduce(|a, b| a + b)
        .expect("at least the final snapshot");
    assert_eq!(total.tasks_enqueued, 2);
    assert_eq!(total.tasks_started, 1);
    assert_eq!(total.tasks_interrupted, 1);
    assert_eq!(total.tasks_completed, 1);
    assert_eq!(total.tasks_rejected, 0);
}

#[tokio::test(start_paused = true)]
async fn metered_rate_limiter_counts_queued_cancellation() {
    let snapshots: Arc<Mutex<Vec<RateLimiterMetrics>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let snapshots = Arc::clone(&snapshots);
        move |snapshot: RateLimiterMetrics| snapshots.lock().unwrap().push(snapshot)
    };

    let limiter = RateLimiter::builder()
        .max(1)
        .interval(Duration::from_secs(1))
        .build()
        .unwrap();
    let metered = Arc::new(MeteredRateLimiter::new(
        limiter,
        HistogramSettings::new(1_000, 10_000_000_000),
        Duration::from_secs(3600),
        sink,
    ));

    metered
        .call(|| async { Ok::<_, TestError>(()) })
        .await
        .unwrap();

    // The window is spent for a second; this caller waits, then is cancelled.
    let waiting = {
        let metered = Arc::clone(&metered);
        tokio::spawn(async move {
            metered.call(|| async { Ok::<_, TestError>(()) }).await
        })
    };
    settle().await;
    waiting.abort();
    settle().await;

    let metered = Arc::try_unwrap(metered)
        .map_err(|_| "metered limiter still shared")
        .unwrap();
    drop(metered);

    let total = snapshots
        .lock()
        .unwrap()
        .drain(..)
        .reduce(|a, b| a + b)
        .expect("at least the final snapshot");
    assert_eq!(total.tasks_enqueued, 2);
    assert_eq!(total.tasks_started, 1);
    assert_eq!(total.tasks_interrupted, 1);
}

#[tokio::test(start_paused = true)]
async fn metered_rate_limiter_emits_one_snapshot_per_interval() {
    let snapshots: Arc<Mutex<Vec<RateLimiterMetrics>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let snapshots = Arc::clone(&snapshots);
        move |snapshot: RateLimiterMetrics| snapshots.lock().unwrap().push(snapshot)
    };

    let limiter = RateLimiter::builder()
        .max(1000)
        .interval(Duration::from_secs(1))
        .build()
        .unwrap();
    let metered = MeteredRateLimiter::new(
        limiter,
        HistogramSettings::new(1_000, 10_000_000_000),
        Duration::from_secs(1),
        sink,
    );

    for _ in 0..101 {
        metered
            .call(|| async { Ok::<_, TestError>(()) })
            .await
            .unwrap();
    }

    advance(Duration::from_secs(1)).await;
    settle().await;
    advance(Duration::from_secs(1)).await;
    settle().await;
    advance(Duration::from_millis(500)).await;
    settle().await;
    drop(metered);

    let collected = snapshots.lock().unwrap();
    assert_eq!(collected.len(), 3);

    let total = collected
        .iter()
        .cloned()
        .reduce(|a, b| a + b)
        .unwrap();
    assert_eq!(total.interval, Duration::from_millis(2500));
    assert_eq!(total.tasks_enqueued, 101);
    assert_eq!(total.tasks_started, 101);
    assert_eq!(total.tasks_interrupted, 0);
    assert_eq!(total.queue_latency.count(), 101);
}

#[tokio::test(start_paused = true)]
async fn metered_breaker_counts_outcomes() {
    let snapshots: Arc<Mutex<Vec<resilience_rs::BreakerMetrics>>> =
        Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let snapshots = Arc::clone(&snapshots);
        move |snapshot: resilience_rs::BreakerMetrics| snapshots.lock().unwrap().push(snapshot)
    };

    let breaker = CircuitBreaker::<TestError>::builder()
        .max_failures(2)
        .build()
        .unwrap();
    let metered = MeteredCircuitBreaker::new(breaker, Duration::from_secs(3600), sink);

    assert!(metered
        .call(|| async { Ok::<_, TestError>(()) })
        .await
        .is_ok());
    for _ in 0..2 {
        let _ = metered
            .call(|| async { Err::<(), _>(TestError::new("boom")) })
            .await;
    }
    // Tripped: this one is rejected.
    let _ = metered
        .call(|| async { Ok::<_, TestError>(()) })
        .await;

    drop(metered);

    let total = snapshots
        .lock()
        .unwrap()
        .drain(..)
        .reduce(|a, b| a + b)
        .unwrap();
    assert_eq!(total.calls, 4);
    assert_eq!(total.successes, 1);
    assert_eq!(total.failures, 2);
    assert_eq!(total.rejections, 1);
}
