//! Cyclic wake-up loop.
//!
//! Each iteration:
//! 1. Advance the absolute deadline by one period
//! 2. Sleep until the deadline (`clock_nanosleep` with `TIMER_ABSTIME`)
//! 3. Measure how late the wake-up was
//! 4. Publish the wake time for the secondary producer
//! 5. Run the periodic payload
//! 6. Record the latency
//!
//! Deadlines are derived from the aligned start time, never from the
//! measured wake time, so one late wake-up does not shift the schedule.

use crate::clock::Clock;
use crate::payload::PeriodicPayload;
use crossbeam_utils::CachePadded;
use rtlat_common::config::RecordingMode;
use rtlat_common::error::LatResult;
use rtlat_common::metrics::{LatencyAlert, LatencyLimits, Metrics, SharedTimestamp};
use rtlat_common::state::{LoopState, LoopStateMachine, StopReason};
use rtlat_common::time::Timestamp;
use serde::Serialize;
use std::io::Write;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Samples between two progress log lines.
pub const PROGRESS_INTERVAL: u64 = 10_000;

/// Anything that gives shared access to a [`Metrics`] instance.
pub trait MetricsHandle: Deref<Target = Metrics> + Send + Sync + 'static {}

impl<T> MetricsHandle for T where T: Deref<Target = Metrics> + Send + Sync + 'static {}

/// The loop's most recent wake-up time, read by the secondary producer.
///
/// Readers may see a torn value while the loop stores.
#[derive(Debug, Default)]
pub struct LastWake(CachePadded<SharedTimestamp>);

impl LastWake {
    /// Create a slot holding `ts`.
    #[must_use]
    pub fn new(ts: Timestamp) -> Self {
        Self(CachePadded::new(SharedTimestamp::new(ts)))
    }

    /// Store a new wake time.
    #[inline]
    pub fn publish(&self, ts: Timestamp) {
        self.0.store(ts);
    }

    /// Read the latest wake time.
    #[inline]
    pub fn load(&self) -> Timestamp {
        self.0.load()
    }
}

/// Cooperative stop request shared by the measuring threads.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    /// A flag that is not raised.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag.
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true once the flag is raised.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Result of a single iteration.
#[derive(Debug, Clone, Copy)]
pub struct CycleResult {
    /// Scheduled wake-up.
    pub deadline: Timestamp,
    /// Observed wake-up.
    pub woke: Timestamp,
    /// `woke - deadline` in µs.
    pub latency_us: i64,
    /// Alert raised by this sample, if any.
    pub alert: Option<LatencyAlert>,
}

/// What the loop did before stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Iterations completed.
    pub iterations: u64,
    /// Alerts printed.
    pub alerts: u64,
    /// Alert lines the writer rejected.
    pub alert_errors: u64,
    /// Payload invocations that failed.
    pub payload_errors: u64,
    /// Why the loop ended.
    pub stop_reason: StopReason,
}

/// The cyclic measuring loop.
pub struct CyclicLoop<C: Clock, M: MetricsHandle> {
    clock: C,
    shared: Arc<M>,
    /// Private sink used instead of `shared` when another producer records.
    local: Option<Box<Metrics>>,
    limits: LatencyLimits,
    iterations: u64,
    payload: Option<Box<dyn PeriodicPayload>>,
    unblock_on_stop: bool,
    last_wake: Arc<LastWake>,
    shutdown: ShutdownFlag,
    alerts: Box<dyn Write + Send>,
    state: LoopStateMachine,
    next_deadline: Timestamp,
    completed: u64,
    alert_count: u64,
    alert_errors: u64,
    payload_errors: u64,
}

impl<C: Clock, M: MetricsHandle> CyclicLoop<C, M> {
    /// Current loop state.
    pub fn state(&self) -> LoopState {
        self.state.state()
    }

    /// Iterations completed so far.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// The metrics this loop records its own samples into.
    pub fn recording_metrics(&self) -> &Metrics {
        match &self.local {
            Some(local) => &**local,
            None => &**self.shared,
        }
    }

    /// Shared wake-time slot for a secondary producer.
    pub fn last_wake(&self) -> Arc<LastWake> {
        Arc::clone(&self.last_wake)
    }

    /// Flag raised when the loop stops.
    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    /// Align the first deadline to the period and mark the window start.
    pub fn start(&mut self) {
        let arith = self.limits.arith;
        let anchor = arith.align_to_period(self.clock.now(), self.limits.period_us);

        self.next_deadline = anchor;
        self.shared.mark_start(anchor);
        self.shared.record_period(self.limits.period_us);
        if let Some(local) = &self.local {
            local.mark_start(anchor);
            local.record_period(self.limits.period_us);
        }
        self.last_wake.publish(anchor);

        info!(
            period_us = self.limits.period_us,
            alert_us = self.limits.alert_us,
            iterations = self.iterations,
            anchor = %anchor,
            "Cyclic loop started"
        );
    }

    /// Execute one iteration. [`start`](Self::start) must have run first.
    pub fn run_cycle(&mut self) -> CycleResult {
        let arith = self.limits.arith;

        let deadline = arith.add_us(self.next_deadline, self.limits.period_us);
        self.next_deadline = deadline;
        self.clock.sleep_until(deadline);

        let woke = self.clock.now();
        let latency_us = arith.diff_us(deadline, woke);
        self.last_wake.publish(woke);

        if let Some(payload) = self.payload.as_mut() {
            if let Err(e) = payload.fire() {
                self.payload_errors += 1;
                if self.payload_errors == 1 {
                    warn!(error = %e, "Periodic payload failed");
                }
            }
        }

        let metrics: &Metrics = match &self.local {
            Some(local) => &**local,
            None => &**self.shared,
        };
        let alert = metrics.update(latency_us, woke, &self.limits);
        if let Some(alert) = alert {
            self.alert_count += 1;
            if let Err(e) = writeln!(self.alerts, "{alert}") {
                self.alert_errors += 1;
                if self.alert_errors == 1 {
                    warn!(error = %e, "Cannot write alert line");
                }
            }
        }

        self.completed += 1;
        if self.completed % PROGRESS_INTERVAL == 0 {
            info!(
                samples = metrics.counter(),
                max_us = metrics.max_lat(),
                late = metrics.late_count(),
                "Measuring"
            );
        }

        CycleResult {
            deadline,
            woke,
            latency_us,
            alert,
        }
    }

    /// Run until the iteration budget is spent or shutdown is requested.
    ///
    /// This blocks the current thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop was already stopped.
    pub fn run(&mut self) -> LatResult<RunSummary> {
        if self.state.state().is_stopped() {
            self.state.stop(StopReason::ShutdownRequested)?;
        }

        self.start();

        let reason = loop {
            if self.shutdown.is_requested() {
                break StopReason::ShutdownRequested;
            }
            self.run_cycle();
            if self.iterations != 0 && self.completed >= self.iterations {
                break StopReason::IterationsExhausted;
            }
        };
        self.state.stop(reason)?;
        self.finish();

        let summary = RunSummary {
            iterations: self.completed,
            alerts: self.alert_count,
            alert_errors: self.alert_errors,
            payload_errors: self.payload_errors,
            stop_reason: reason,
        };
        info!(?summary, "Cyclic loop stopped");
        Ok(summary)
    }

    /// Release counterparts waiting on the loop.
    fn finish(&mut self) {
        self.shutdown.request();
        if !self.unblock_on_stop {
            return;
        }
        if let Some(payload) = self.payload.as_mut() {
            debug!("Firing payload once more to unblock receiver");
            if let Err(e) = payload.fire() {
                warn!(error = %e, "Final payload invocation failed");
            }
        }
    }
}

/// Builder for configuring the loop.
pub struct CyclicLoopBuilder<C: Clock, M: MetricsHandle> {
    clock: C,
    shared: Arc<M>,
    limits: LatencyLimits,
    iterations: u64,
    mode: RecordingMode,
    payload: Option<Box<dyn PeriodicPayload>>,
    unblock_on_stop: bool,
    last_wake: Option<Arc<LastWake>>,
    shutdown: Option<ShutdownFlag>,
    alerts: Option<Box<dyn Write + Send>>,
}

impl<C: Clock, M: MetricsHandle> CyclicLoopBuilder<C, M> {
    /// Create a builder with a 1 ms period and no iteration limit.
    pub fn new(clock: C, metrics: Arc<M>) -> Self {
        Self {
            clock,
            shared: metrics,
            limits: LatencyLimits::new(1000),
            iterations: 0,
            mode: RecordingMode::Primary,
            payload: None,
            unblock_on_stop: true,
            last_wake: None,
            shutdown: None,
            alerts: None,
        }
    }

    /// Set period, alert threshold, and arithmetic.
    #[must_use]
    pub fn limits(mut self, limits: LatencyLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Number of periods to run; zero runs until shutdown.
    #[must_use]
    pub fn iterations(mut self, iterations: u64) -> Self {
        self.iterations = iterations;
        self
    }

    /// Select who records into the shared metrics.
    #[must_use]
    pub fn recording(mut self, mode: RecordingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Run `payload` once per period.
    #[must_use]
    pub fn payload(mut self, payload: Box<dyn PeriodicPayload>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Fire the payload once more after stopping.
    #[must_use]
    pub fn unblock_on_stop(mut self, enabled: bool) -> Self {
        self.unblock_on_stop = enabled;
        self
    }

    /// Share an existing wake-time slot.
    #[must_use]
    pub fn last_wake(mut self, slot: Arc<LastWake>) -> Self {
        self.last_wake = Some(slot);
        self
    }

    /// Share an existing shutdown flag.
    #[must_use]
    pub fn shutdown(mut self, flag: ShutdownFlag) -> Self {
        self.shutdown = Some(flag);
        self
    }

    /// Write alert lines somewhere other than stdout.
    #[must_use]
    pub fn alert_writer(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.alerts = Some(writer);
        self
    }

    /// Build the loop.
    pub fn build(self) -> CyclicLoop<C, M> {
        let local = match self.mode {
            RecordingMode::Primary => None,
            RecordingMode::Secondary => Some(Box::new(Metrics::new())),
        };

        CyclicLoop {
            clock: self.clock,
            shared: self.shared,
            local,
            limits: self.limits,
            iterations: self.iterations,
            payload: self.payload,
            unblock_on_stop: self.unblock_on_stop,
            last_wake: self.last_wake.unwrap_or_default(),
            shutdown: self.shutdown.unwrap_or_default(),
            alerts: self.alerts.unwrap_or_else(|| Box::new(std::io::stdout())),
            state: LoopStateMachine::new(),
            next_deadline: Timestamp::ZERO,
            completed: 0,
            alert_count: 0,
            alert_errors: 0,
            payload_errors: 0,
        }
    }
}
