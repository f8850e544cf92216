//! Configuration structures for the latency probe.
//!
//! Supports TOML deserialization with sensible defaults; every section is
//! optional and durations use humantime notation (`"1ms"`, `"10s"`).

use crate::metrics::LatencyLimits;
use crate::time::TimeArith;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Logical name of the shared metrics region.
pub const DEFAULT_SHM_NAME: &str = "/RT_METRICS";

/// Longest accepted period.
pub const MAX_PERIOD: Duration = Duration::from_secs(60);

/// Top-level probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Nominal wake-up period.
    #[serde(with = "humantime_serde")]
    pub period: Duration,

    /// Console alert threshold; defaults to the period.
    #[serde(
        with = "humantime_serde_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub alert_threshold: Option<Duration>,

    /// Measurement length; zero runs until shutdown.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    /// Timestamp arithmetic used on the measuring path.
    pub time_arith: TimeArith,

    /// Which producer feeds the shared histogram.
    pub recording: RecordingMode,

    /// Request a reset before the first sample so the window starts clean.
    pub reset_on_start: bool,

    /// Name of the POSIX shared memory object.
    pub shm_name: String,

    /// Real-time configuration.
    pub realtime: RealtimeConfig,

    /// Periodic payload and loopback configuration.
    pub payload: PayloadConfig,

    /// Kernel tuning applied around a run.
    pub environment: EnvironmentConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(1),
            alert_threshold: None,
            duration: Duration::ZERO,
            time_arith: TimeArith::default(),
            recording: RecordingMode::default(),
            reset_on_start: true,
            shm_name: DEFAULT_SHM_NAME.to_string(),
            realtime: RealtimeConfig::default(),
            payload: PayloadConfig::default(),
            environment: EnvironmentConfig::default(),
        }
    }
}

/// Which producer records into the shared histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordingMode {
    /// The cyclic loop records its own wake-up latency.
    #[default]
    Primary,
    /// The secondary producer records loopback latency; the loop's own
    /// samples go to a private, process-local instance.
    Secondary,
}

/// Real-time scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Apply real-time setup at all.
    pub enabled: bool,

    /// Scheduler policy: "fifo", "rr", or "other".
    pub policy: SchedPolicy,

    /// Scheduler priority (1-99 for RT policies).
    pub priority: u8,

    /// CPUs the measuring threads are pinned to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_affinity: Option<CpuAffinity>,

    /// Lock all memory pages (mlockall).
    pub lock_memory: bool,

    /// Stack bytes to pre-fault on each measuring thread.
    pub prefault_stack_size: usize,

    /// Treat any failure to acquire RT attributes as fatal.
    pub fail_fast: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: SchedPolicy::Fifo,
            priority: 90,
            cpu_affinity: None,
            lock_memory: true,
            prefault_stack_size: 256 * 1024,
            fail_fast: true,
        }
    }
}

/// Scheduler policy for the measuring threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// SCHED_FIFO: First-in-first-out real-time.
    #[default]
    Fifo,
    /// SCHED_RR: Round-robin real-time.
    Rr,
    /// SCHED_OTHER: Normal time-sharing (non-RT).
    Other,
}

impl std::str::FromStr for SchedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fifo" | "sched_fifo" => Ok(Self::Fifo),
            "rr" | "sched_rr" => Ok(Self::Rr),
            "other" | "sched_other" => Ok(Self::Other),
            _ => Err(format!("unknown scheduler policy '{s}' (expected fifo, rr, other)")),
        }
    }
}

/// CPU affinity specification: one core or a set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CpuAffinity {
    /// Pin to a single CPU core.
    Single(usize),
    /// Pin to a set of CPU cores.
    Set(Vec<usize>),
}

impl CpuAffinity {
    /// The CPUs as a list.
    #[must_use]
    pub fn cpus(&self) -> Vec<usize> {
        match self {
            Self::Single(cpu) => vec![*cpu],
            Self::Set(cpus) => cpus.clone(),
        }
    }
}

/// Serial line parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
}

/// Serial device used as periodic payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device node, e.g. `/dev/ttyS0`.
    pub device: PathBuf,
    /// Line speed.
    pub baud: u32,
    /// Parity setting (8 data bits, 1 stop bit are fixed).
    pub parity: Parity,
    /// Byte written once per period.
    pub byte: u8,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/ttyS0"),
            baud: 115_200,
            parity: Parity::None,
            byte: 0x55,
        }
    }
}

/// Periodic payload configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadConfig {
    /// Serial device written once per period.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<SerialConfig>,

    /// Read the written byte back (TX wired to RX) as the secondary producer's event.
    pub loopback: bool,

    /// Invoke the payload once more on stop to release a blocked receiver.
    pub unblock_on_stop: bool,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            serial: None,
            loopback: false,
            unblock_on_stop: true,
        }
    }
}

/// Kernel tuning applied before a run and undone afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Hold `/dev/cpu_dma_latency` open with the target below.
    pub cpu_dma_latency: bool,

    /// Latency target written to `/dev/cpu_dma_latency`, in µs.
    pub latency_target_us: i32,

    /// Directory holding the kernel tunables.
    pub kernel_dir: PathBuf,

    /// Tunables to override, restored on exit.
    pub kernel_vars: BTreeMap<String, String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        let kernel_vars = [("preempt_thresh", "0"), ("preempt_max_latency", "0")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Self {
            cpu_dma_latency: false,
            latency_target_us: 0,
            kernel_dir: PathBuf::from("/proc/sys/kernel"),
            kernel_vars,
        }
    }
}

fn micros(d: Duration) -> i64 {
    i64::try_from(d.as_micros()).unwrap_or(i64::MAX)
}

impl ProbeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = Self::from_toml(&content)?;
        debug!(path = %path.display(), "Configuration file parsed");
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Period in whole microseconds.
    #[must_use]
    pub fn period_us(&self) -> i64 {
        micros(self.period)
    }

    /// Alert threshold in whole microseconds.
    #[must_use]
    pub fn alert_us(&self) -> i64 {
        self.alert_threshold.map_or_else(|| self.period_us(), micros)
    }

    /// Number of periods to run, zero for unbounded.
    #[must_use]
    pub fn iterations(&self) -> u64 {
        let period = self.period.as_micros();
        if period == 0 {
            return 0;
        }
        u64::try_from(self.duration.as_micros() / period).unwrap_or(u64::MAX)
    }

    /// Per-sample thresholds derived from this configuration.
    #[must_use]
    pub fn limits(&self) -> LatencyLimits {
        LatencyLimits::new(self.period_us())
            .with_alert(self.alert_us())
            .with_arith(self.time_arith)
    }

    /// Check the values for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.period_us() < 1 {
            return Err(ConfigError::Invalid("period must be at least 1us".into()));
        }
        if self.period > MAX_PERIOD {
            return Err(ConfigError::Invalid(format!(
                "period {} exceeds the maximum of {}",
                humantime::format_duration(self.period),
                humantime::format_duration(MAX_PERIOD)
            )));
        }
        if self.alert_us() < 1 {
            return Err(ConfigError::Invalid(
                "alert threshold must be at least 1us".into(),
            ));
        }
        if !self.duration.is_zero() && self.duration < self.period {
            return Err(ConfigError::Invalid(
                "duration is shorter than one period".into(),
            ));
        }
        if !self.shm_name.starts_with('/')
            || self.shm_name.len() < 2
            || self.shm_name[1..].contains('/')
        {
            return Err(ConfigError::Invalid(format!(
                "shared memory name '{}' must be '/' followed by a name without slashes",
                self.shm_name
            )));
        }
        if self.recording == RecordingMode::Secondary
            && (self.payload.serial.is_none() || !self.payload.loopback)
        {
            return Err(ConfigError::Invalid(
                "secondary recording needs a serial payload with loopback enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Values parsed but are inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Same as [`humantime_serde`] for optional durations.
mod humantime_serde_opt {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => super::humantime_serde::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
