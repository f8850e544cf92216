//! Secondary correlated producer.
//!
//! A second measuring thread waits for its own event (typically the byte the
//! cyclic loop's payload sent, arriving over a loopback cable) and times it
//! against the loop's most recent wake-up. When the recording mode is
//! [`RecordingMode::Secondary`] those latencies go into the shared metrics;
//! otherwise events are only counted.

use crate::clock::Clock;
use crate::cyclic::{LastWake, MetricsHandle, ShutdownFlag};
use rtlat_common::config::RecordingMode;
use rtlat_common::error::LatResult;
use rtlat_common::metrics::LatencyLimits;
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one wait on an [`EventSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The awaited event happened.
    Arrived,
    /// Nothing arrived within the source's timeout.
    Timeout,
}

/// Something the secondary producer blocks on.
///
/// Implementations must return periodically (with [`Event::Timeout`]) so
/// that shutdown is observed even when no event arrives.
pub trait EventSource: Send {
    /// Block until the next event or the source's timeout.
    ///
    /// # Errors
    ///
    /// Returns an error when the source failed; the producer stops.
    fn wait(&mut self) -> LatResult<Event>;
}

/// Counters reported when the producer exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SecondarySummary {
    /// Events observed.
    pub events: u64,
    /// Events whose latency was recorded.
    pub recorded: u64,
    /// Waits that timed out.
    pub timeouts: u64,
    /// Alert lines the writer rejected.
    pub alert_errors: u64,
}

/// Times events against the loop's last wake-up.
pub struct SecondaryProducer<C: Clock, S: EventSource, M: MetricsHandle> {
    clock: C,
    source: S,
    metrics: Arc<M>,
    limits: LatencyLimits,
    mode: RecordingMode,
    last_wake: Arc<LastWake>,
    shutdown: ShutdownFlag,
    alerts: Box<dyn Write + Send>,
}

impl<C: Clock, S: EventSource, M: MetricsHandle> SecondaryProducer<C, S, M> {
    /// Create a producer. Alerts go to stdout.
    pub fn new(
        clock: C,
        source: S,
        metrics: Arc<M>,
        limits: LatencyLimits,
        mode: RecordingMode,
        last_wake: Arc<LastWake>,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            clock,
            source,
            metrics,
            limits,
            mode,
            last_wake,
            shutdown,
            alerts: Box::new(std::io::stdout()),
        }
    }

    /// Redirect alert lines.
    #[must_use]
    pub fn with_alert_writer(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.alerts = writer;
        self
    }

    /// Run until the shutdown flag is raised.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by the event source.
    pub fn run(&mut self) -> LatResult<SecondarySummary> {
        info!(mode = ?self.mode, "Secondary producer started");
        let mut summary = SecondarySummary::default();

        while !self.shutdown.is_requested() {
            match self.source.wait()? {
                Event::Timeout => summary.timeouts += 1,
                Event::Arrived => {
                    let now = self.clock.now();
                    // the loop's final unblocking event is not a sample
                    if self.shutdown.is_requested() {
                        break;
                    }
                    summary.events += 1;

                    if self.mode != RecordingMode::Secondary {
                        continue;
                    }
                    let latency = self.limits.arith.diff_us(self.last_wake.load(), now);
                    if let Some(alert) = self.metrics.update(latency, now, &self.limits) {
                        if let Err(e) = writeln!(self.alerts, "{alert}") {
                            summary.alert_errors += 1;
                            if summary.alert_errors == 1 {
                                warn!(error = %e, "Cannot write alert line");
                            }
                        }
                    }
                    summary.recorded += 1;
                }
            }
        }

        debug!(?summary, "Secondary producer stopped");
        Ok(summary)
    }
}
