//! Entry points: run a measurement, request a reset, read a report.
//!
//! A run goes through these steps:
//! 1. Attach the shared metrics region (creating it if needed)
//! 2. Prepare the environment (kernel tunables, DMA latency request)
//! 3. Process-wide real-time setup (capability check, mlockall)
//! 4. Spawn the cyclic loop and, with a loopback device, the secondary producer
//! 5. Join both threads, restore the environment, build the report

use crate::clock::{Clock, MonotonicClock};
use crate::cyclic::{CyclicLoopBuilder, MetricsHandle, RunSummary, ShutdownFlag};
use crate::environment::{EnvironmentPreparer, KernelTuning};
use crate::payload::{open_serial, LoopbackReceiver, PeriodicPayload};
use crate::realtime;
use crate::secondary::{SecondaryProducer, SecondarySummary};
use crate::shm::SharedMetrics;
use rtlat_common::config::{ProbeConfig, SchedPolicy};
use rtlat_common::error::{LatError, LatResult};
use rtlat_common::metrics::LatencyReport;
use serde::Serialize;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info};

/// Extra stack on top of the pre-faulted part for each measuring thread.
const THREAD_STACK_MARGIN: usize = 256 * 1024;

/// A cloneable, thread-safe destination for alert lines.
#[derive(Clone)]
pub struct AlertSink(Arc<Mutex<Box<dyn Write + Send>>>);

impl AlertSink {
    /// Wrap any writer.
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self(Arc::new(Mutex::new(Box::new(writer))))
    }

    /// Alerts go to standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl Write for AlertSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| std::io::Error::other("alert sink poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0
            .lock()
            .map_err(|_| std::io::Error::other("alert sink poisoned"))?
            .flush()
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    /// Cyclic loop summary.
    pub cyclic: RunSummary,
    /// Secondary producer summary, when one ran.
    pub secondary: Option<SecondarySummary>,
    /// Report of the shared metrics after the run.
    pub report: LatencyReport,
}

/// A configured probe.
#[derive(Debug, Clone)]
pub struct Probe {
    config: ProbeConfig,
}

impl Probe {
    /// Create a probe after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns [`LatError::Config`] if the configuration is inconsistent.
    pub fn new(config: ProbeConfig) -> LatResult<Self> {
        config
            .validate()
            .map_err(|e| LatError::Config(e.to_string()))?;
        Ok(Self { config })
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Measure with the system clock into the named shared region.
    ///
    /// `shutdown` may be raised from outside (e.g. a signal handler) to stop
    /// an unbounded run; it is raised by the loop when it stops.
    ///
    /// # Errors
    ///
    /// Returns bootstrap failures: shared memory, real-time setup, serial
    /// device, thread creation.
    pub fn run(&self, shutdown: ShutdownFlag) -> LatResult<ProbeOutcome> {
        let metrics = Arc::new(SharedMetrics::open_or_create(&self.config.shm_name)?);
        let mut environment = KernelTuning::new(self.config.environment.clone())
            .unlock_memory_on_restore(
                self.config.realtime.enabled && self.config.realtime.lock_memory,
            );
        self.execute(
            MonotonicClock::new(),
            metrics,
            &mut environment,
            shutdown,
            AlertSink::stdout(),
        )
    }

    /// Run with explicit collaborators.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub fn execute<C, M>(
        &self,
        clock: C,
        metrics: Arc<M>,
        environment: &mut dyn EnvironmentPreparer,
        shutdown: ShutdownFlag,
        alerts: AlertSink,
    ) -> LatResult<ProbeOutcome>
    where
        C: Clock + Clone + 'static,
        M: MetricsHandle,
    {
        if self.config.reset_on_start {
            metrics.request_reset();
        }

        environment.prepare()?;
        let result = self.spawn_and_join(clock, &metrics, shutdown, alerts);
        environment.restore();

        let (cyclic, secondary) = result?;
        let report = metrics.report(self.config.period_us(), self.config.time_arith);
        Ok(ProbeOutcome {
            cyclic,
            secondary,
            report,
        })
    }

    fn spawn_and_join<C, M>(
        &self,
        clock: C,
        metrics: &Arc<M>,
        shutdown: ShutdownFlag,
        alerts: AlertSink,
    ) -> LatResult<(RunSummary, Option<SecondarySummary>)>
    where
        C: Clock + Clone + 'static,
        M: MetricsHandle,
    {
        let config = &self.config;
        realtime::init_process(&config.realtime)?;

        let (payload, receiver): (Option<Box<dyn PeriodicPayload>>, Option<LoopbackReceiver>) =
            match &config.payload.serial {
                Some(serial) => {
                    let (payload, receiver) = open_serial(serial)?;
                    let receiver = config.payload.loopback.then_some(receiver);
                    (Some(Box::new(payload) as Box<dyn PeriodicPayload>), receiver)
                }
                None => (None, None),
            };

        let mut builder = CyclicLoopBuilder::new(clock.clone(), Arc::clone(metrics))
            .limits(config.limits())
            .iterations(config.iterations())
            .recording(config.recording)
            .unblock_on_stop(config.payload.unblock_on_stop)
            .shutdown(shutdown.clone())
            .alert_writer(Box::new(alerts.clone()));
        if let Some(payload) = payload {
            builder = builder.payload(payload);
        }
        let mut cyclic = builder.build();
        let last_wake = cyclic.last_wake();

        let stack_size = config.realtime.prefault_stack_size + THREAD_STACK_MARGIN;
        let secondary_handle = match receiver {
            Some(receiver) => {
                let mut producer = SecondaryProducer::new(
                    clock,
                    receiver,
                    Arc::clone(metrics),
                    config.limits(),
                    config.recording,
                    last_wake,
                    shutdown.clone(),
                )
                .with_alert_writer(Box::new(alerts));
                let rt = config.realtime.clone();
                let flag = shutdown.clone();
                Some(spawn_measuring("rtlat-secondary", stack_size, move || {
                    let result =
                        realtime::init_thread(&rt, "secondary").and_then(|_| producer.run());
                    if result.is_err() {
                        flag.request();
                    }
                    result
                })?)
            }
            None => None,
        };

        let rt = config.realtime.clone();
        let flag = shutdown.clone();
        let cyclic_handle = match spawn_measuring("rtlat-cyclic", stack_size, move || {
            realtime::init_thread(&rt, "cyclic").inspect_err(|_| flag.request())?;
            cyclic.run()
        }) {
            Ok(handle) => handle,
            Err(e) => {
                shutdown.request();
                if let Some(handle) = secondary_handle {
                    let _ = join_measuring(handle);
                }
                return Err(e);
            }
        };

        let cyclic_result = join_measuring(cyclic_handle);
        if cyclic_result.is_err() {
            shutdown.request();
        }
        let secondary_result = secondary_handle.map(join_measuring).transpose();

        let summary = cyclic_result?;
        let secondary = secondary_result?;
        Ok((summary, secondary))
    }

    /// Ask the producer to clear the shared metrics on its next sample.
    ///
    /// # Errors
    ///
    /// Returns an error if the region cannot be attached.
    pub fn request_reset(&self) -> LatResult<()> {
        let metrics = SharedMetrics::open_or_create(&self.config.shm_name)?;
        metrics.request_reset();
        info!(name = metrics.name(), "Reset requested");
        Ok(())
    }

    /// Read the shared metrics and derive the report. No mutation.
    ///
    /// Uses the period the last run recorded with, falling back to the
    /// configured one for a region no run has written yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the region cannot be attached.
    pub fn report(&self) -> LatResult<LatencyReport> {
        self.report_with_period(None)
    }

    /// Like [`report`](Self::report), with `period` overriding the stored one.
    ///
    /// # Errors
    ///
    /// Returns an error if the region cannot be attached.
    pub fn report_with_period(&self, period: Option<Duration>) -> LatResult<LatencyReport> {
        let metrics = SharedMetrics::open_or_create(&self.config.shm_name)?;
        let period_us = period
            .map(|p| i64::try_from(p.as_micros()).unwrap_or(i64::MAX))
            .or_else(|| metrics.recorded_period_us())
            .unwrap_or_else(|| self.config.period_us());
        Ok(metrics.report(period_us, self.config.time_arith))
    }

    /// Unlink the shared region. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if unlinking fails for another reason.
    pub fn remove(&self) -> LatResult<bool> {
        SharedMetrics::remove(&self.config.shm_name)
    }
}

fn spawn_measuring<T, F>(
    name: &str,
    stack_size: usize,
    body: F,
) -> LatResult<JoinHandle<LatResult<T>>>
where
    T: Send + 'static,
    F: FnOnce() -> LatResult<T> + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .stack_size(stack_size)
        .spawn(body)
        .map_err(|e| LatError::Thread(format!("cannot spawn {name}: {e}")))
}

fn join_measuring<T>(handle: JoinHandle<LatResult<T>>) -> LatResult<T> {
    let name = handle.thread().name().unwrap_or("measuring").to_string();
    match handle.join() {
        Ok(result) => result.inspect_err(|e| error!(thread = %name, error = %e, "Thread failed")),
        Err(_) => Err(LatError::Thread(format!("{name} thread panicked"))),
    }
}

/// Measure `period_us` wake-ups at the given priority for `duration_secs`
/// seconds (zero: until shutdown), using defaults for everything else.
///
/// # Errors
///
/// See [`Probe::run`].
pub fn run(
    period_us: u64,
    priority: u8,
    policy: SchedPolicy,
    duration_secs: u64,
    shutdown: ShutdownFlag,
) -> LatResult<ProbeOutcome> {
    let mut config = ProbeConfig {
        period: Duration::from_micros(period_us),
        duration: Duration::from_secs(duration_secs),
        ..Default::default()
    };
    config.realtime.priority = priority;
    config.realtime.policy = policy;
    Probe::new(config)?.run(shutdown)
}
