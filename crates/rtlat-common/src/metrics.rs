//! Latency histogram and aggregate metrics.
//!
//! [`Metrics`] is a fixed-size `#[repr(C)]` block of atomics, so a single
//! instance can sit in a shared memory region: producers in the measuring
//! process update it while a reporting process reads it. Every field is an
//! integer atomic, so any byte pattern is a valid instance; all-zero is the
//! empty one, which is what a freshly created region contains.
//!
//! # Concurrency
//!
//! There is no lock. Every field is an independent relaxed atomic:
//!
//! - With a single writer (the supported configuration) all invariants hold
//!   between updates.
//! - With several writers (loop and secondary producer both recording, or two
//!   measuring processes) increments are never lost, but the edge-trigger
//!   state is shared, so late/alert edges from interleaved signals can merge.
//! - Readers may observe a snapshot torn across fields, e.g. `counter` one
//!   ahead of the histogram total. Reports are approximate by contract.
//! - A reset request racing with an in-flight update may leave that one
//!   sample partially counted.

use crate::time::{TimeArith, Timestamp};
use serde::Serialize;
use static_assertions::const_assert;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};

/// Number of histogram buckets; latencies `1..HISTOGRAM_SIZE` µs get their own bucket.
pub const HISTOGRAM_SIZE: usize = 1001;

/// Bucket absorbing latencies `<= 0` or `>= HISTOGRAM_SIZE`.
pub const OVERFLOW_BUCKET: usize = 0;

const_assert!(HISTOGRAM_SIZE > 1);

/// Stored level of an edge flag while its condition holds. Any other byte,
/// including stale content of a reused region, reads as low.
const EDGE_HIGH: u8 = 1;

/// A timestamp stored as two relaxed atomics.
///
/// Loads may tear between the two halves under a concurrent store.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SharedTimestamp {
    sec: AtomicI64,
    nsec: AtomicI64,
}

impl SharedTimestamp {
    /// Create a slot holding `ts`.
    #[must_use]
    pub fn new(ts: Timestamp) -> Self {
        Self {
            sec: AtomicI64::new(ts.sec),
            nsec: AtomicI64::new(ts.nsec),
        }
    }

    /// Read the stored timestamp.
    #[inline]
    pub fn load(&self) -> Timestamp {
        Timestamp::new(
            self.sec.load(Ordering::Relaxed),
            self.nsec.load(Ordering::Relaxed),
        )
    }

    /// Overwrite the stored timestamp.
    #[inline]
    pub fn store(&self, ts: Timestamp) {
        self.sec.store(ts.sec, Ordering::Relaxed);
        self.nsec.store(ts.nsec, Ordering::Relaxed);
    }
}

/// Thresholds applied to every sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatencyLimits {
    /// Nominal period; samples at or above it are late.
    pub period_us: i64,
    /// Console alert threshold.
    pub alert_us: i64,
    /// Arithmetic used when re-seeding `start` on reset.
    pub arith: TimeArith,
}

impl LatencyLimits {
    /// Limits with the alert threshold equal to the period.
    #[must_use]
    pub fn new(period_us: i64) -> Self {
        Self {
            period_us,
            alert_us: period_us,
            arith: TimeArith::default(),
        }
    }

    /// Override the alert threshold.
    #[must_use]
    pub fn with_alert(mut self, alert_us: i64) -> Self {
        self.alert_us = alert_us;
        self
    }

    /// Override the timestamp arithmetic.
    #[must_use]
    pub fn with_arith(mut self, arith: TimeArith) -> Self {
        self.arith = arith;
        self
    }
}

/// One console alert, emitted on the rising edge of the alert threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyAlert {
    /// Running sample count at the time of the alert.
    pub counter: u64,
    /// Offending latency.
    pub latency_us: i64,
    /// Latency exceeded the period (not merely the alert threshold).
    pub late: bool,
}

impl fmt::Display for LatencyAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:8} /{:2}.{:03} {}",
            self.counter,
            self.latency_us / 1000,
            self.latency_us % 1000,
            if self.late { '*' } else { ' ' }
        )
    }
}

/// Aggregated latency metrics.
#[repr(C)]
pub struct Metrics {
    /// Non-zero when a reset has been requested.
    reset: AtomicU8,
    /// [`EDGE_HIGH`] inside a run of late samples.
    late_active: AtomicU8,
    /// [`EDGE_HIGH`] while above the alert threshold.
    alert_active: AtomicU8,
    counter: AtomicU64,
    sum_us: AtomicI64,
    max_lat: AtomicI64,
    late_count: AtomicU64,
    late_sum_us: AtomicI64,
    /// Period of the run that last recorded here, zero before any run.
    period_us: AtomicI64,
    start: SharedTimestamp,
    stop: SharedTimestamp,
    histogram: [AtomicU64; HISTOGRAM_SIZE],
}

const_assert!(std::mem::align_of::<Metrics>() == 8);

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("reset_pending", &self.reset_pending())
            .field("counter", &self.counter())
            .field("max_lat", &self.max_lat())
            .field("late_count", &self.late_count())
            .field("start", &self.start())
            .field("stop", &self.stop())
            .finish_non_exhaustive()
    }
}

/// Rising-edge detection on a stored level (R_TRIG semantics).
#[inline]
fn rising_edge(flag: &AtomicU8, level: bool) -> bool {
    let prev = flag.swap(u8::from(level), Ordering::Relaxed);
    level && prev != EDGE_HIGH
}

#[inline]
fn bucket_index(latency_us: i64) -> usize {
    usize::try_from(latency_us)
        .ok()
        .filter(|&i| i > 0 && i < HISTOGRAM_SIZE)
        .unwrap_or(OVERFLOW_BUCKET)
}

impl Metrics {
    /// Create an empty, process-local instance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            reset: AtomicU8::new(0),
            late_active: AtomicU8::new(0),
            alert_active: AtomicU8::new(0),
            counter: AtomicU64::new(0),
            sum_us: AtomicI64::new(0),
            max_lat: AtomicI64::new(0),
            late_count: AtomicU64::new(0),
            late_sum_us: AtomicI64::new(0),
            period_us: AtomicI64::new(0),
            start: SharedTimestamp::default(),
            stop: SharedTimestamp::default(),
            histogram: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Record one latency sample observed at `now`.
    ///
    /// Returns the alert to print when this sample crosses the alert
    /// threshold from below.
    pub fn update(
        &self,
        latency_us: i64,
        now: Timestamp,
        limits: &LatencyLimits,
    ) -> Option<LatencyAlert> {
        if self.reset.load(Ordering::Acquire) != 0 {
            self.clear();
            // keep elapsed time consistent with the sample about to land
            let back = limits.period_us.saturating_add(latency_us);
            self.start.store(limits.arith.sub_us(now, back));
            self.reset.store(0, Ordering::Release);
        }

        let counter = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.histogram[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);

        if rising_edge(&self.late_active, latency_us >= limits.period_us) {
            self.late_count.fetch_add(1, Ordering::Relaxed);
            self.late_sum_us
                .fetch_add(latency_us - limits.period_us, Ordering::Relaxed);
        }

        let alert = rising_edge(&self.alert_active, latency_us >= limits.alert_us).then(|| {
            LatencyAlert {
                counter,
                latency_us,
                late: latency_us > limits.period_us,
            }
        });

        self.max_lat.fetch_max(latency_us, Ordering::Relaxed);
        self.stop.store(now);

        alert
    }

    /// Ask the next [`update`](Self::update) to clear everything first.
    ///
    /// Idempotent; safe to call from any attached process.
    pub fn request_reset(&self) {
        self.reset.store(1, Ordering::Release);
    }

    /// Returns true while a reset request has not yet been honored.
    #[must_use]
    pub fn reset_pending(&self) -> bool {
        self.reset.load(Ordering::Acquire) != 0
    }

    /// Set the start of the measurement window.
    pub fn mark_start(&self, ts: Timestamp) {
        self.start.store(ts);
    }

    /// Remember the period samples are being recorded with.
    ///
    /// Survives resets, so a later report can use it.
    pub fn record_period(&self, period_us: i64) {
        self.period_us.store(period_us, Ordering::Relaxed);
    }

    /// Period stored by the last run, `None` if no run has stored one.
    #[must_use]
    pub fn recorded_period_us(&self) -> Option<i64> {
        Some(self.period_us.load(Ordering::Relaxed)).filter(|&p| p > 0)
    }

    fn clear(&self) {
        self.late_active.store(0, Ordering::Relaxed);
        self.alert_active.store(0, Ordering::Relaxed);
        self.counter.store(0, Ordering::Relaxed);
        self.sum_us.store(0, Ordering::Relaxed);
        self.max_lat.store(0, Ordering::Relaxed);
        self.late_count.store(0, Ordering::Relaxed);
        self.late_sum_us.store(0, Ordering::Relaxed);
        self.start.store(Timestamp::ZERO);
        self.stop.store(Timestamp::ZERO);
        for bucket in &self.histogram {
            bucket.store(0, Ordering::Relaxed);
        }
    }

    /// Total samples since the last reset.
    #[must_use]
    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Sum of all sample latencies.
    #[must_use]
    pub fn sum_us(&self) -> i64 {
        self.sum_us.load(Ordering::Relaxed)
    }

    /// Largest latency seen (never below zero).
    #[must_use]
    pub fn max_lat(&self) -> i64 {
        self.max_lat.load(Ordering::Relaxed)
    }

    /// Number of distinct runs of late samples.
    #[must_use]
    pub fn late_count(&self) -> u64 {
        self.late_count.load(Ordering::Relaxed)
    }

    /// Cumulative overshoot beyond the period for the first sample of each late run.
    #[must_use]
    pub fn late_sum_us(&self) -> i64 {
        self.late_sum_us.load(Ordering::Relaxed)
    }

    /// Start of the measurement window.
    #[must_use]
    pub fn start(&self) -> Timestamp {
        self.start.load()
    }

    /// Time of the most recent sample.
    #[must_use]
    pub fn stop(&self) -> Timestamp {
        self.stop.load()
    }

    /// Count in one histogram bucket, zero when out of range.
    #[must_use]
    pub fn bucket(&self, index: usize) -> u64 {
        self.histogram
            .get(index)
            .map_or(0, |b| b.load(Ordering::Relaxed))
    }

    /// Sum over every bucket, overflow included.
    #[must_use]
    pub fn histogram_total(&self) -> u64 {
        self.histogram
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .sum()
    }

    /// Copy the current values out, field by field.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reset_pending: self.reset_pending(),
            counter: self.counter(),
            sum_us: self.sum_us(),
            max_lat: self.max_lat(),
            late_count: self.late_count(),
            late_sum_us: self.late_sum_us(),
            start: self.start(),
            stop: self.stop(),
            histogram: self
                .histogram
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
        }
    }

    /// Build the summary report for a given nominal period.
    #[must_use]
    pub fn report(&self, period_us: i64, arith: TimeArith) -> LatencyReport {
        self.snapshot().report(period_us, arith)
    }
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// A reset has been requested but not applied yet.
    pub reset_pending: bool,
    /// Total samples.
    pub counter: u64,
    /// Sum of latencies.
    pub sum_us: i64,
    /// Maximum latency.
    pub max_lat: i64,
    /// Late runs.
    pub late_count: u64,
    /// Cumulative late overshoot.
    pub late_sum_us: i64,
    /// Window start.
    pub start: Timestamp,
    /// Window end.
    pub stop: Timestamp,
    /// Bucket counts, index = latency in µs, `[0]` = overflow.
    pub histogram: Vec<u64>,
}

impl MetricsSnapshot {
    /// Mean latency, `None` without samples.
    #[must_use]
    pub fn mean_us(&self) -> Option<i64> {
        let count = i64::try_from(self.counter).ok().filter(|&c| c > 0)?;
        Some(self.sum_us / count)
    }

    /// Derive the summary report.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn report(&self, period_us: i64, arith: TimeArith) -> LatencyReport {
        let elapsed_us = arith.diff_us(self.start, self.stop);
        let rounds = if period_us > 0 {
            elapsed_us as f64 / period_us as f64
        } else {
            0.0
        };

        let buckets = self
            .histogram
            .iter()
            .enumerate()
            .skip(1)
            .filter(|&(_, &count)| count > 0)
            .map(|(latency_us, &count)| BucketCount { latency_us, count })
            .collect();

        LatencyReport {
            samples: self.counter,
            period_us,
            elapsed_us,
            rounds,
            max_us: self.max_lat,
            mean_us: self.mean_us(),
            late_count: self.late_count,
            late_sum_us: self.late_sum_us,
            overflow: self.histogram.get(OVERFLOW_BUCKET).copied().unwrap_or(0),
            reset_pending: self.reset_pending,
            buckets,
        }
    }
}

/// One non-empty histogram bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketCount {
    /// Bucket latency in µs.
    pub latency_us: usize,
    /// Occurrences.
    pub count: u64,
}

/// Summary printed by the report invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyReport {
    /// Samples observed.
    pub samples: u64,
    /// Nominal period used for the derived values.
    pub period_us: i64,
    /// Elapsed time between window start and last sample.
    pub elapsed_us: i64,
    /// Elapsed time expressed in periods.
    pub rounds: f64,
    /// Maximum latency.
    pub max_us: i64,
    /// Mean latency, `None` without samples.
    pub mean_us: Option<i64>,
    /// Late runs.
    pub late_count: u64,
    /// Cumulative late overshoot.
    pub late_sum_us: i64,
    /// Overflow bucket count.
    pub overflow: u64,
    /// A reset is pending.
    pub reset_pending: bool,
    /// Non-empty buckets, overflow excluded.
    pub buckets: Vec<BucketCount>,
}

/// Split a signed value into its sign, whole `unit`s, and remainder.
fn split_signed(us: i64, unit: i64) -> (&'static str, i64, i64) {
    let sign = if us < 0 { "-" } else { "" };
    let abs = us.unsigned_abs();
    let unit = unit.unsigned_abs();
    (sign, (abs / unit) as i64, (abs % unit) as i64)
}

impl fmt::Display for LatencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.buckets {
            writeln!(f, "{:06} {:06}", b.latency_us, b.count)?;
        }

        let (sign, secs, micros) = split_signed(self.elapsed_us, 1_000_000);
        writeln!(f, "run time     = {sign}{secs}.{micros:06} s")?;
        writeln!(f, "samples      = {}", self.samples)?;
        writeln!(f, "period       = {} us", self.period_us)?;
        writeln!(f, "rounds       = {:.3}", self.rounds)?;
        writeln!(f, "max latency  = {} us", self.max_us)?;
        match self.mean_us {
            Some(mean) => writeln!(f, "mean latency = {mean} us")?,
            None => writeln!(f, "mean latency = no samples")?,
        }
        writeln!(f, "late count   = {}", self.late_count)?;
        let (sign, ms, frac) = split_signed(self.late_sum_us, 1_000);
        writeln!(f, "late sum     = {sign}{ms}.{frac:03} ms")?;
        write!(f, "overflow     = {}", self.overflow)?;
        if self.reset_pending {
            write!(f, "\n(reset pending)")?;
        }
        Ok(())
    }
}
