//! Bounded log-bucketed histogram.

use std::sync::Arc;

use parking_lot::Mutex;

/// Bucket layout for a [`Histogram`]: log-spaced buckets covering
/// `[min, max]`.
///
/// Values are unitless `u64`s — the metrics layer records queue latencies in
/// nanoseconds and gauge samples as plain counts against the same primitive.
/// Observations outside the range clamp to the edge buckets so histograms
/// with the same settings always stay addable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramSettings {
    min: u64,
    max: u64,
    bucket_count: usize,
}

impl HistogramSettings {
    const DEFAULT_BUCKETS: usize = 32;

    /// Settings covering `[min, max]` with the default bucket count.
    ///
    /// `min` is clamped to at least 1 (log spacing needs a positive lower
    /// edge) and `max` to at least `min + 1`.
    pub fn new(min: u64, max: u64) -> Self {
        let min = min.max(1);
        Self {
            min,
            max: max.max(min + 1),
            bucket_count: Self::DEFAULT_BUCKETS,
        }
    }

    /// Overrides the number of buckets (at least 1).
    pub fn bucket_count(mut self, count: usize) -> Self {
        self.bucket_count = count.max(1);
        self
    }

    /// Lower edge of the covered range.
    pub fn min(&self) -> u64 {
        self.min
    }

    /// Upper edge of the covered range.
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Derives the inclusive upper bound of each bucket, eagerly.
    fn boundaries(&self) -> Arc<[u64]> {
        let count = self.bucket_count;
        let ratio = (self.max as f64 / self.min as f64).powf(1.0 / count as f64);

        let mut bounds = Vec::with_capacity(count);
        let mut previous = self.min;
        for index in 0..count {
            let bound = if index == count - 1 {
                self.max
            } else {
                let raw = (self.min as f64 * ratio.powi(index as i32 + 1)).round() as u64;
                // Keep the sequence increasing despite rounding; narrow
                // ranges may saturate early at `max`.
                raw.max(previous.saturating_add(1)).min(self.max)
            };
            bounds.push(bound);
            previous = bound;
        }
        bounds.into()
    }
}

/// Concurrent histogram with eagerly derived log-spaced buckets.
///
/// All cells sit behind one short lock so a drain-and-reset is atomic with
/// respect to concurrent records: every observation lands wholly in exactly
/// one drained snapshot.
pub struct Histogram {
    bounds: Arc<[u64]>,
    min: u64,
    max: u64,
    cells: Mutex<Cells>,
}

struct Cells {
    buckets: Box<[u64]>,
    count: u64,
    sum: u64,
    min_seen: u64,
    max_seen: u64,
}

impl Cells {
    fn new(bucket_count: usize) -> Self {
        Self {
            buckets: vec![0; bucket_count].into_boxed_slice(),
            count: 0,
            sum: 0,
            min_seen: u64::MAX,
            max_seen: 0,
        }
    }

    fn reset(&mut self) {
        self.buckets.iter_mut().for_each(|bucket| *bucket = 0);
        self.count = 0;
        self.sum = 0;
        self.min_seen = u64::MAX;
        self.max_seen = 0;
    }

    fn to_snapshot(&self, bounds: &Arc<[u64]>) -> HistogramSnapshot {
        HistogramSnapshot {
            bounds: Arc::clone(bounds),
            buckets: self.buckets.to_vec(),
            count: self.count,
            sum: self.sum,
            min_seen: self.min_seen,
            max_seen: self.max_seen,
        }
    }
}

impl Histogram {
    /// Empty histogram with the given bucket layout.
    pub fn new(settings: HistogramSettings) -> Self {
        let bounds = settings.boundaries();
        let cells = Mutex::new(Cells::new(bounds.len()));

        Self {
            bounds,
            min: settings.min(),
            max: settings.max(),
            cells,
        }
    }

    /// Records one observation, clamped to the covered range.
    pub fn record(&self, value: u64) {
        let value = value.clamp(self.min, self.max);
        let index = self.bounds.partition_point(|bound| *bound < value);
        let mut cells = self.cells.lock();
        cells.buckets[index] += 1;
        cells.count += 1;
        cells.sum = cells.sum.saturating_add(value);
        cells.min_seen = cells.min_seen.min(value);
        cells.max_seen = cells.max_seen.max(value);
    }

    /// Number of recorded observations.
    pub fn count(&self) -> u64 {
        self.cells.lock().count
    }

    /// Non-destructive snapshot.
    pub fn snapshot(&self) -> HistogramSnapshot {
        self.cells.lock().to_snapshot(&self.bounds)
    }

    /// Snapshot that leaves the histogram empty. Serialized with
    /// [`record`](Histogram::record), so no observation is ever split
    /// across two snapshots.
    pub(crate) fn drain(&self) -> HistogramSnapshot {
        let mut cells = self.cells.lock();
        let snapshot = cells.to_snapshot(&self.bounds);
        cells.reset();
        snapshot
    }
}

/// Immutable, addable record of histogram contents.
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    bounds: Arc<[u64]>,
    buckets: Vec<u64>,
    count: u64,
    sum: u64,
    min_seen: u64,
    max_seen: u64,
}

impl HistogramSnapshot {
    /// Number of observations.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sum of all (clamped) observations.
    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// Mean observation, if any were recorded.
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum as f64 / self.count as f64)
    }

    /// Smallest recorded observation.
    pub fn min(&self) -> Option<u64> {
        (self.count > 0).then_some(self.min_seen)
    }

    /// Largest recorded observation.
    pub fn max(&self) -> Option<u64> {
        (self.count > 0).then_some(self.max_seen)
    }

    /// Upper bound of the bucket holding the `p`-quantile (`0.0..=1.0`).
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.count == 0 || !(0.0..=1.0).contains(&p) {
            return None;
        }

        let rank = ((self.count as f64 - 1.0) * p).ceil() as u64;
        let mut accumulated = 0u64;
        for (index, bucket) in self.buckets.iter().enumerate() {
            accumulated += bucket;
            if accumulated > rank {
                return Some(self.bounds[index]);
            }
        }
        self.max()
    }

    /// Per-bucket observation counts.
    pub fn bucket_counts(&self) -> &[u64] {
        &self.buckets
    }

    /// Inclusive upper bound of each bucket.
    pub fn boundaries(&self) -> &[u64] {
        &self.bounds
    }

    /// Bucket-wise sum of two snapshots with the same settings.
    ///
    /// Adding snapshots from differently configured histograms is a caller
    /// bug; debug builds assert it, release builds fold what lines up.
    pub fn merge(mut self, other: &HistogramSnapshot) -> HistogramSnapshot {
        debug_assert_eq!(self.bounds, other.bounds, "histogram settings differ");
        for (bucket, other_bucket) in self.buckets.iter_mut().zip(&other.buckets) {
            *bucket += other_bucket;
        }
        self.count += other.count;
        self.sum = self.sum.saturating_add(other.sum);
        self.min_seen = self.min_seen.min(other.min_seen);
        self.max_seen = self.max_seen.max(other.max_seen);
        self
    }
}
