//! Shared metrics region acceptance tests.
//!
//! Each test uses its own region name and removes it afterwards. Tests are
//! skipped when POSIX shared memory is not available in the environment.

use super::common::{simulated_config, unique_shm_name};
use rtlat_common::metrics::LatencyLimits;
use rtlat_common::time::Timestamp;
use rtlat_runtime::{AlertSink, NoTuning, Probe, SharedMetrics, ShutdownFlag, SimulatedClock};
use std::sync::Arc;
use std::time::Duration;

fn open(name: &str) -> Option<SharedMetrics> {
    match SharedMetrics::open_or_create(name) {
        Ok(metrics) => Some(metrics),
        Err(e) => {
            println!("Skipping test due to error: {e}");
            None
        }
    }
}

/// Two mappings of one name see each other's writes.
#[test]
fn test_mappings_share_one_region() {
    let name = unique_shm_name("share");
    let Some(writer) = open(&name) else { return };
    let reader = SharedMetrics::open_or_create(&name).unwrap();
    let limits = LatencyLimits::new(1000);

    writer.update(42, Timestamp::new(1, 0), &limits);
    writer.update(1500, Timestamp::new(1, 1_000_000), &limits);

    assert_eq!(reader.counter(), 2);
    assert_eq!(reader.bucket(42), 1);
    assert_eq!(reader.max_lat(), 1500);
    assert_eq!(reader.late_count(), 1);

    // a reset requested through one mapping is honored by the writer
    reader.request_reset();
    assert!(writer.reset_pending());
    writer.update(7, Timestamp::new(2, 0), &limits);
    assert_eq!(reader.counter(), 1);
    assert_eq!(reader.bucket(42), 0);
    assert!(!reader.reset_pending());

    drop(reader);
    drop(writer);
    assert!(SharedMetrics::remove(&name).unwrap());
}

/// Metrics stay resident after the last mapping goes away.
#[test]
fn test_metrics_outlive_mapping() {
    let name = unique_shm_name("resident");
    let Some(metrics) = open(&name) else { return };
    let limits = LatencyLimits::new(1000);
    for i in 0..3 {
        metrics.update(10 + i, Timestamp::new(5, 0), &limits);
    }
    drop(metrics);

    let reopened = SharedMetrics::open_or_create(&name).unwrap();
    assert_eq!(reopened.counter(), 3);
    assert_eq!(reopened.sum_us(), 33);
    drop(reopened);

    assert!(SharedMetrics::remove(&name).unwrap());
    assert!(!SharedMetrics::remove(&name).unwrap());
}

/// A report taken through a separate attachment matches what the run saw.
#[test]
fn test_report_reads_region_written_by_run() {
    let name = unique_shm_name("report");
    let Some(metrics) = open(&name) else { return };

    let mut config = simulated_config(Duration::from_millis(20));
    config.shm_name = name.clone();
    let probe = Probe::new(config).unwrap();

    let outcome = probe
        .execute(
            SimulatedClock::with_latencies(Timestamp::new(40, 0), [250, 0, 0, 999]),
            Arc::new(metrics),
            &mut NoTuning,
            ShutdownFlag::new(),
            AlertSink::new(std::io::sink()),
        )
        .unwrap();

    let report = probe.report().unwrap();
    assert_eq!(report, outcome.report);
    assert_eq!(report.samples, 20);
    assert_eq!(report.max_us, 999);

    probe.request_reset().unwrap();
    let pending = probe.report().unwrap();
    assert!(pending.reset_pending);
    assert_eq!(pending.samples, 20);

    assert!(probe.remove().unwrap());
}

/// A later report uses the period the run recorded with, not its own default.
#[test]
fn test_report_uses_recorded_period() {
    let name = unique_shm_name("period");
    let Some(metrics) = open(&name) else { return };

    let mut config = simulated_config(Duration::from_millis(5));
    config.period = Duration::from_micros(250);
    config.shm_name = name.clone();
    Probe::new(config)
        .unwrap()
        .execute(
            SimulatedClock::new(Timestamp::new(60, 0)),
            Arc::new(metrics),
            &mut NoTuning,
            ShutdownFlag::new(),
            AlertSink::new(std::io::sink()),
        )
        .unwrap();

    let mut reader_config = simulated_config(Duration::from_secs(1));
    reader_config.shm_name = name.clone();
    let reader = Probe::new(reader_config).unwrap();

    let report = reader.report().unwrap();
    assert_eq!(report.samples, 20);
    assert_eq!(report.period_us, 250);
    assert!((report.rounds - 20.0).abs() < 1e-9);

    let overridden = reader
        .report_with_period(Some(Duration::from_micros(500)))
        .unwrap();
    assert_eq!(overridden.period_us, 500);
    assert!((overridden.rounds - 10.0).abs() < 1e-9);

    assert!(reader.remove().unwrap());
}
