//! Latency measurement acceptance tests.
//!
//! Simulated runs check the numbers the probe reports for known wake-up
//! patterns. The real-clock runs check that a measurement completes and
//! produces a plausible window.
//!
//! # Requirements
//!
//! - Root privileges and PREEMPT_RT kernel for the ignored tests

use super::common::{check_rt_prerequisites, simulated_config, unique_shm_name, CapturedAlerts};
use rtlat_common::config::{ProbeConfig, SchedPolicy};
use rtlat_common::metrics::Metrics;
use rtlat_common::state::StopReason;
use rtlat_common::time::{TimeArith, Timestamp};
use rtlat_runtime::{
    AlertSink, Clock, MonotonicClock, NoTuning, Probe, ProbeOutcome, SharedMetrics,
    ShutdownFlag, SimulatedClock,
};
use std::sync::Arc;
use std::time::Duration;

fn execute<C: Clock + Clone + 'static>(
    config: ProbeConfig,
    clock: C,
    metrics: &Arc<Box<Metrics>>,
) -> ProbeOutcome {
    Probe::new(config)
        .expect("valid configuration")
        .execute(
            clock,
            Arc::clone(metrics),
            &mut NoTuning,
            ShutdownFlag::new(),
            AlertSink::new(std::io::sink()),
        )
        .expect("probe run")
}

/// A run that always wakes on time records nothing but zeros.
#[test]
fn test_zero_latency_run() {
    let metrics = Arc::new(Box::new(Metrics::new()));
    let outcome = execute(
        simulated_config(Duration::from_secs(1)),
        SimulatedClock::new(Timestamp::new(100, 0)),
        &metrics,
    );

    assert_eq!(outcome.cyclic.iterations, 1000);
    assert_eq!(outcome.cyclic.stop_reason, StopReason::IterationsExhausted);
    assert_eq!(metrics.counter(), 1000);
    assert_eq!(metrics.histogram_total(), 1000);

    let report = &outcome.report;
    assert_eq!(report.samples, 1000);
    assert_eq!(report.max_us, 0);
    assert_eq!(report.mean_us, Some(0));
    assert_eq!(report.late_count, 0);
    assert_eq!(report.late_sum_us, 0);
    assert_eq!(report.elapsed_us, 1_000_000);
    assert!((report.rounds - 1000.0).abs() < 1e-9);
    assert!(report.buckets.is_empty());
    assert!(!report.reset_pending);
}

/// One 5 ms wake-up at a 1 ms period: a single alert and a single late run,
/// even though the loop needs several periods to catch up.
#[test]
fn test_single_spike() {
    let metrics = Arc::new(Box::new(Metrics::new()));
    let alerts = CapturedAlerts::default();
    let probe = Probe::new(simulated_config(Duration::from_millis(100))).unwrap();

    let outcome = probe
        .execute(
            SimulatedClock::with_latencies(Timestamp::new(100, 0), [0, 0, 5000]),
            Arc::clone(&metrics),
            &mut NoTuning,
            ShutdownFlag::new(),
            alerts.sink(),
        )
        .unwrap();

    assert_eq!(alerts.lines(), vec!["       3 / 5.000 *".to_string()]);
    assert_eq!(outcome.cyclic.alerts, 1);

    let report = &outcome.report;
    assert_eq!(report.samples, 100);
    assert_eq!(report.max_us, 5000);
    assert_eq!(report.late_count, 1);
    assert_eq!(report.late_sum_us, 4000);
    // catch-up wake-ups: 4000, 3000, 2000, 1000
    assert_eq!(report.mean_us, Some(150));
    assert_eq!(report.buckets.len(), 1);
    assert_eq!(report.buckets[0].latency_us, 1000);
    assert_eq!(report.buckets[0].count, 1);
    assert_eq!(report.overflow, 99);
}

/// Both timestamp arithmetic variants produce the same report, including
/// across a second boundary right after the start.
#[test]
fn test_arithmetic_variants_agree() {
    let latencies = [13, 0, 2500, 999, 1000, 0, 47, 1];
    let start = Timestamp::new(7, 999_500_000);

    let run = |arith: TimeArith| {
        let mut config = simulated_config(Duration::from_millis(40));
        config.time_arith = arith;
        let metrics = Arc::new(Box::new(Metrics::new()));
        execute(
            config,
            SimulatedClock::with_latencies(start, latencies),
            &metrics,
        )
        .report
    };

    let reference = run(TimeArith::Reference);
    let division_free = run(TimeArith::DivisionFree);

    assert_eq!(reference, division_free);
    assert_eq!(reference.samples, 40);
    assert_eq!(reference.max_us, 2500);
}

/// Without a reset request samples from consecutive runs accumulate.
#[test]
fn test_runs_accumulate_without_reset() {
    let metrics = Arc::new(Box::new(Metrics::new()));

    execute(
        simulated_config(Duration::from_millis(20)),
        SimulatedClock::new(Timestamp::new(10, 0)),
        &metrics,
    );
    assert_eq!(metrics.counter(), 20);

    let mut keep = simulated_config(Duration::from_millis(30));
    keep.reset_on_start = false;
    let outcome = execute(keep, SimulatedClock::new(Timestamp::new(20, 0)), &metrics);
    assert_eq!(outcome.report.samples, 50);

    let outcome = execute(
        simulated_config(Duration::from_millis(10)),
        SimulatedClock::new(Timestamp::new(30, 0)),
        &metrics,
    );
    assert_eq!(outcome.report.samples, 10);
    assert_eq!(outcome.report.elapsed_us, 10_000);
}

/// A shutdown raised before the loop starts yields an empty, honest report.
#[test]
fn test_shutdown_before_first_sample() {
    let mut config = simulated_config(Duration::ZERO);
    config.reset_on_start = false;
    let metrics = Arc::new(Box::new(Metrics::new()));
    let shutdown = ShutdownFlag::new();
    shutdown.request();

    let outcome = Probe::new(config)
        .unwrap()
        .execute(
            SimulatedClock::new(Timestamp::new(1, 0)),
            Arc::clone(&metrics),
            &mut NoTuning,
            shutdown,
            AlertSink::new(std::io::sink()),
        )
        .unwrap();

    assert_eq!(outcome.cyclic.iterations, 0);
    assert_eq!(outcome.cyclic.stop_reason, StopReason::ShutdownRequested);
    assert_eq!(outcome.report.samples, 0);
    assert_eq!(outcome.report.mean_us, None);
    assert!(outcome
        .report
        .to_string()
        .contains("mean latency = no samples"));
}

/// A short run on the monotonic clock without real-time privileges.
#[test]
fn test_monotonic_clock_run() {
    let mut config = ProbeConfig {
        duration: Duration::from_millis(50),
        ..Default::default()
    };
    config.realtime.policy = SchedPolicy::Other;
    config.realtime.lock_memory = false;
    config.realtime.fail_fast = false;

    let metrics = Arc::new(Box::new(Metrics::new()));
    let outcome = execute(config, MonotonicClock::new(), &metrics);

    let report = &outcome.report;
    println!("{report}");
    assert_eq!(report.samples, 50);
    assert_eq!(metrics.histogram_total(), 50);
    assert!(report.elapsed_us >= 50_000);
    assert!(report.max_us >= 0);
    assert!(report.max_us < 1_000_000, "max latency {}us", report.max_us);
}

/// A full probe run at real-time priority into a shared region.
#[test]
#[ignore = "Requires root and an RT kernel"]
fn test_rt_run_into_shared_region() {
    if let Err(e) = check_rt_prerequisites() {
        eprintln!("Skipping test: {}", e);
        return;
    }

    let mut config = ProbeConfig {
        duration: Duration::from_secs(2),
        shm_name: unique_shm_name("rt"),
        ..Default::default()
    };
    config.realtime.priority = 80;
    let probe = Probe::new(config).unwrap();

    let outcome = probe.run(ShutdownFlag::new()).expect("RT probe run");
    println!("{}", outcome.report);

    assert_eq!(outcome.report.samples, 2000);
    assert_eq!(probe.report().unwrap().samples, 2000);
    assert!(probe.remove().unwrap());
}

/// The alert threshold can sit below the period.
#[test]
#[ignore = "Requires root and an RT kernel"]
fn test_rt_run_with_low_alert_threshold() {
    if let Err(e) = check_rt_prerequisites() {
        eprintln!("Skipping test: {}", e);
        return;
    }

    let mut config = ProbeConfig {
        duration: Duration::from_secs(1),
        alert_threshold: Some(Duration::from_micros(1)),
        shm_name: unique_shm_name("alert"),
        ..Default::default()
    };
    config.realtime.policy = SchedPolicy::Fifo;
    let shm_name = config.shm_name.clone();

    let metrics = Arc::new(SharedMetrics::open_or_create(&shm_name).unwrap());
    let alerts = CapturedAlerts::default();
    let outcome = Probe::new(config)
        .unwrap()
        .execute(
            MonotonicClock::new(),
            metrics,
            &mut NoTuning,
            ShutdownFlag::new(),
            alerts.sink(),
        )
        .unwrap();

    println!("{}", outcome.report);
    assert_eq!(outcome.cyclic.alerts as usize, alerts.lines().len());
    assert!(SharedMetrics::remove(&shm_name).unwrap());
}
