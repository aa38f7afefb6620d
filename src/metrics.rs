//! Metrics collected and aggregated during load tests.
//!
//! Every request a virtual user makes produces one [`RequestSample`]. Samples are
//! recorded into an [`Aggregator`], which spreads them across a fixed number of
//! independently locked shards so that concurrent virtual users rarely contend. Each
//! shard keeps exact counters plus a [`LatencyDigest`], a bounded-memory HDR
//! histogram, and [`Aggregator::snapshot`] merges the shards into one
//! [`AggregateStats`].

use chrono::prelude::*;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Latencies are tracked in microseconds from 1µs up to one hour.
const DIGEST_LOW: u64 = 1;
const DIGEST_HIGH: u64 = 60 * 60 * 1_000_000;
/// Three significant figures keeps relative error under 0.1%.
const DIGEST_SIGFIG: u8 = 3;

/// The result of a single request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    /// A network error, timeout or non-2xx status, with a short reason.
    Failure(String),
}
impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// One request made by a virtual user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestSample {
    /// Which virtual user made the request.
    pub user: usize,
    /// When the request started.
    pub started: DateTime<Utc>,
    /// How long the request took.
    pub latency: Duration,
    pub outcome: Outcome,
    /// Size of the response body, if known.
    pub size_bytes: Option<u64>,
    /// Set when the measured latency was negative and clamped to zero.
    pub clamped: bool,
}
impl RequestSample {
    pub fn new(user: usize, started: DateTime<Utc>, latency: Duration, outcome: Outcome) -> Self {
        RequestSample {
            user,
            started,
            latency,
            outcome,
            size_bytes: None,
            clamped: false,
        }
    }

    /// Build a sample from wall-clock start and finish times.
    ///
    /// A finish time before the start time (for example after a clock step) is
    /// clamped to a zero latency and flagged rather than rejected.
    ///
    /// # Example
    /// ```rust
    /// use chrono::{Duration, Utc};
    /// use stampede::metrics::{Outcome, RequestSample};
    ///
    /// let started = Utc::now();
    /// let sample = RequestSample::between(1, started, started - Duration::milliseconds(5), Outcome::Success);
    /// assert!(sample.clamped);
    /// assert_eq!(sample.latency, std::time::Duration::ZERO);
    /// ```
    pub fn between(
        user: usize,
        started: DateTime<Utc>,
        finished: DateTime<Utc>,
        outcome: Outcome,
    ) -> Self {
        let (latency, clamped) = match (finished - started).to_std() {
            Ok(latency) => (latency, false),
            Err(_) => (Duration::ZERO, true),
        };
        RequestSample {
            user,
            started,
            latency,
            outcome,
            size_bytes: None,
            clamped,
        }
    }

    pub fn set_size_bytes(mut self, size_bytes: Option<u64>) -> Self {
        self.size_bytes = size_bytes;
        self
    }
}

/// A mergeable latency summary with bounded relative error.
///
/// Backed by an HDR histogram in microseconds with three significant figures, so
/// memory use is fixed no matter how many samples are recorded, and any quantile is
/// within 0.1% of the exact value over the same samples.
#[derive(Clone)]
pub struct LatencyDigest {
    histogram: Histogram<u64>,
}
impl LatencyDigest {
    pub fn new() -> Self {
        LatencyDigest {
            histogram: Histogram::new_with_bounds(DIGEST_LOW, DIGEST_HIGH, DIGEST_SIGFIG)
                .expect("failed to create latency histogram with static bounds"),
        }
    }

    /// Record one latency. Returns `false` if the value is out of range and was
    /// not recorded.
    pub fn record(&mut self, latency: Duration) -> bool {
        // Sub-microsecond latencies land in the lowest bucket.
        let micros = (latency.as_micros() as u64).max(DIGEST_LOW);
        self.histogram.record(micros).is_ok()
    }

    /// Add every value of `other` into this digest. Returns `false` if the merge
    /// failed and `other` was not added.
    pub fn merge(&mut self, other: &LatencyDigest) -> bool {
        self.histogram.add(&other.histogram).is_ok()
    }

    /// Number of recorded latencies.
    pub fn len(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    /// The latency at percentile `p`, from 0 to 100.
    pub fn percentile(&self, p: f64) -> Duration {
        if self.is_empty() {
            return Duration::ZERO;
        }
        let quantile = (p / 100.0).clamp(0.0, 1.0);
        Duration::from_micros(self.histogram.value_at_quantile(quantile))
    }

    pub fn min(&self) -> Duration {
        if self.is_empty() {
            return Duration::ZERO;
        }
        Duration::from_micros(self.histogram.min())
    }

    pub fn max(&self) -> Duration {
        if self.is_empty() {
            return Duration::ZERO;
        }
        Duration::from_micros(self.histogram.max())
    }

    pub fn mean(&self) -> Duration {
        if self.is_empty() {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.histogram.mean() / 1_000_000.0)
    }
}
impl Default for LatencyDigest {
    fn default() -> Self {
        LatencyDigest::new()
    }
}
impl PartialEq for LatencyDigest {
    fn eq(&self, other: &Self) -> bool {
        self.histogram == other.histogram
    }
}
impl fmt::Debug for LatencyDigest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LatencyDigest")
            .field("len", &self.len())
            .field("min", &self.min())
            .field("max", &self.max())
            .finish()
    }
}

/// Counters and latency digest for a set of samples.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregateStats {
    /// Total samples recorded.
    pub count: u64,
    /// Samples with a [`Outcome::Failure`].
    pub failure_count: u64,
    /// Samples whose latency was clamped to zero.
    pub clamped_count: u64,
    /// Samples counted but left out of the digest.
    pub dropped_count: u64,
    /// Sum of all known response sizes.
    pub total_bytes: u64,
    pub digest: LatencyDigest,
}
impl AggregateStats {
    pub fn new() -> Self {
        AggregateStats::default()
    }

    /// Append one sample. Counters always move; a digest failure only bumps
    /// `dropped_count`.
    pub fn record(&mut self, sample: &RequestSample) {
        self.count += 1;
        if !sample.outcome.is_success() {
            self.failure_count += 1;
        }
        if sample.clamped {
            self.clamped_count += 1;
        }
        if let Some(size_bytes) = sample.size_bytes {
            self.total_bytes += size_bytes;
        }
        if !self.digest.record(sample.latency) {
            self.dropped_count += 1;
        }
    }

    /// Fold `other` into this aggregate.
    pub fn merge(&mut self, other: &AggregateStats) {
        self.count += other.count;
        self.failure_count += other.failure_count;
        self.clamped_count += other.clamped_count;
        self.total_bytes += other.total_bytes;
        self.dropped_count += other.dropped_count;
        if !self.digest.merge(&other.digest) {
            self.dropped_count += other.digest.len();
        }
    }

    /// Fraction of samples that failed, from 0 to 1.
    pub fn failure_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.failure_count as f64 / self.count as f64
        }
    }

    pub fn percentile(&self, p: f64) -> Duration {
        self.digest.percentile(p)
    }
}

/// Thread-safe, sharded sample collector.
///
/// `record` takes one short lock on a single shard, picked by the recording virtual
/// user's id, so users spread across shards. `snapshot` locks each shard in turn and
/// merges them; every shard is exact, the merged view is a point-in-time-ish blend.
///
/// # Example
/// ```rust
/// use chrono::Utc;
/// use stampede::metrics::{Aggregator, Outcome, RequestSample};
/// use std::time::Duration;
///
/// let aggregator = Aggregator::new(4);
/// for user in 0..8 {
///     aggregator.record(RequestSample::new(user, Utc::now(), Duration::from_millis(5), Outcome::Success));
/// }
/// let stats = aggregator.snapshot();
/// assert_eq!(stats.count, 8);
/// assert_eq!(stats.failure_count, 0);
/// ```
#[derive(Debug)]
pub struct Aggregator {
    shards: Vec<Mutex<AggregateStats>>,
}
impl Aggregator {
    /// Create an aggregator with `shards` shards, at least one.
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(AggregateStats::new()))
            .collect();
        Aggregator { shards }
    }

    pub fn shards(&self) -> usize {
        self.shards.len()
    }

    /// Append a sample. Never fails; a poisoned shard is recovered and reused.
    pub fn record(&self, sample: RequestSample) {
        let shard = &self.shards[sample.user % self.shards.len()];
        let mut stats = shard.lock().unwrap_or_else(PoisonError::into_inner);
        stats.record(&sample);
    }

    /// Merge all shards into one aggregate.
    pub fn snapshot(&self) -> AggregateStats {
        let mut merged = AggregateStats::new();
        for shard in &self.shards {
            let stats = shard.lock().unwrap_or_else(PoisonError::into_inner);
            merged.merge(&stats);
        }
        merged
    }

    /// The latency at percentile `p` across all shards.
    pub fn percentile(&self, p: f64) -> Duration {
        self.snapshot().percentile(p)
    }
}
