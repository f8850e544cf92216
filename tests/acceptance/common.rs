//! Common utilities for integration tests.
//!
//! Provides helpers for:
//! - Checking real-time prerequisites (PREEMPT_RT, privileges)
//! - Building probe configurations for simulated runs
//! - Capturing alert output

use rtlat_common::config::ProbeConfig;
use rtlat_runtime::AlertSink;
use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Global counter for unique shared memory names.
static SHM_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Check if the system has PREEMPT_RT kernel.
pub fn has_preempt_rt() -> bool {
    if let Ok(version) = fs::read_to_string("/proc/version") {
        version.contains("PREEMPT_RT") || version.contains("PREEMPT RT")
    } else {
        false
    }
}

/// Check if running as root (required for RT priority).
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Check all prerequisites for real-time tests.
pub fn check_rt_prerequisites() -> Result<(), String> {
    if !has_preempt_rt() {
        eprintln!("WARNING: PREEMPT_RT kernel not detected - latency results may be unreliable");
    }

    if is_root() {
        Ok(())
    } else {
        Err("Not running as root - RT priority tests will fail".to_string())
    }
}

/// A shared memory name no other test uses.
pub fn unique_shm_name(tag: &str) -> String {
    let pid = std::process::id();
    let counter = SHM_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("/rtlat_test_{tag}_{pid}_{counter}")
}

/// A configuration that measures for `duration` at a 1 ms period without
/// touching scheduler settings or memory locks.
pub fn simulated_config(duration: Duration) -> ProbeConfig {
    let mut config = ProbeConfig {
        duration,
        ..Default::default()
    };
    config.realtime.enabled = false;
    config
}

/// Alert lines written by a probe.
#[derive(Clone, Default)]
pub struct CapturedAlerts(Arc<Mutex<Vec<u8>>>);

impl CapturedAlerts {
    /// A sink feeding this capture.
    pub fn sink(&self) -> AlertSink {
        AlertSink::new(self.clone())
    }

    /// Captured lines.
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for CapturedAlerts {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
