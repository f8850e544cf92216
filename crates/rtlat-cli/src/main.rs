//! rtlat entry point.
//!
//! Runs the cyclic latency probe, or operates on the shared metrics region
//! left behind by a run: request a reset, print a report, remove it.

mod signals;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use rtlat_common::config::{CpuAffinity, ProbeConfig, RecordingMode, SchedPolicy, SerialConfig};
use rtlat_runtime::{realtime, Probe, ProbeOutcome, ShutdownFlag};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};

use crate::signals::SignalHandler;

/// Environment variable naming a configuration file.
const CONFIG_ENV: &str = "RTLAT_CONFIG_PATH";

/// System-wide configuration file.
const SYSTEM_CONFIG: &str = "/etc/rtlat/config.toml";

/// rtlat command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "rtlat",
    about = "Measure scheduling latency of a periodic real-time task",
    version,
    long_about = None
)]
struct Args {
    /// Path to a probe configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the cyclic loop and record latencies.
    Run(RunArgs),
    /// Ask a running probe to clear its metrics on the next sample.
    Reset,
    /// Print the current contents of the shared metrics.
    Report {
        /// Print as JSON instead of text.
        #[arg(long)]
        json: bool,

        /// Period to derive rounds with, instead of the one the run stored.
        #[arg(long, value_parser = humantime::parse_duration)]
        period: Option<Duration>,
    },
    /// Unlink the shared metrics region.
    Remove,
}

#[derive(ClapArgs, Debug)]
struct RunArgs {
    /// Wake-up period, e.g. "1ms" or "250us".
    #[arg(long, short = 'p', value_parser = humantime::parse_duration)]
    period: Option<Duration>,

    /// Real-time priority of the measuring threads.
    #[arg(long, short = 'P')]
    priority: Option<u8>,

    /// Scheduling policy (fifo, rr, other).
    #[arg(long)]
    policy: Option<SchedPolicy>,

    /// Measurement length, e.g. "10s".
    #[arg(long, short = 'd', value_parser = humantime::parse_duration, conflicts_with = "forever")]
    duration: Option<Duration>,

    /// Run until interrupted.
    #[arg(long)]
    forever: bool,

    /// Print an alert line for latencies at or above this value.
    #[arg(long, short = 'a', value_parser = humantime::parse_duration)]
    alert: Option<Duration>,

    /// Pin the measuring threads to these CPUs.
    #[arg(long, value_delimiter = ',')]
    cpu: Vec<usize>,

    /// Keep the metrics already in the region.
    #[arg(long)]
    no_reset: bool,

    /// Skip real-time scheduling and memory locking.
    #[arg(long)]
    no_rt: bool,

    /// Serial device written once per period.
    #[arg(long, value_name = "DEVICE")]
    serial: Option<PathBuf>,

    /// Time the serial byte read back over a loopback cable.
    #[arg(long, requires = "serial")]
    loopback: bool,

    /// Print the final report as JSON.
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    match dispatch(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("rtlat: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(args: &Args) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;

    if !realtime::is_root() {
        warn!("Not running as root; shared memory and scheduling may be restricted");
    }

    match &args.command {
        Command::Run(run) => {
            apply_run_overrides(&mut config, run);
            run_probe(config, run.json)
        }
        Command::Reset => {
            let probe = Probe::new(config).context("Invalid configuration")?;
            probe
                .request_reset()
                .context("Failed to request metrics reset")
        }
        Command::Report { json, period } => {
            let probe = Probe::new(config).context("Invalid configuration")?;
            let report = probe
                .report_with_period(*period)
                .context("Failed to read shared metrics")?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{report}");
            }
            Ok(())
        }
        Command::Remove => {
            let probe = Probe::new(config).context("Invalid configuration")?;
            let name = probe.config().shm_name.clone();
            if probe.remove().context("Failed to remove shared metrics")? {
                info!(name = %name, "Shared metrics removed");
            } else {
                warn!(name = %name, "Shared metrics did not exist");
            }
            Ok(())
        }
    }
}

/// Initialize logging with the specified log level.
///
/// Logs go to stderr; stdout carries alert lines and the report.
fn init_logging(level: &str) {
    let filter = format!("rtlat={level},rtlat_runtime={level},rtlat_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `RTLAT_CONFIG_PATH` environment variable
/// 3. `/etc/rtlat/config.toml` (system path)
/// 4. Built-in defaults
fn load_config(explicit: Option<&Path>) -> Result<ProbeConfig> {
    if let Some(config_path) = explicit {
        info!(?config_path, "Loading config from command-line argument");
        return ProbeConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()));
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from {CONFIG_ENV}");
            return ProbeConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {CONFIG_ENV}={env_path}"));
        }
        warn!(
            path = %env_path,
            "{CONFIG_ENV} set but file does not exist, checking other locations"
        );
    }

    let system_path = Path::new(SYSTEM_CONFIG);
    if system_path.exists() {
        info!(?system_path, "Loading config from system path");
        return ProbeConfig::from_file(system_path)
            .with_context(|| format!("Failed to load config from {SYSTEM_CONFIG}"));
    }

    info!("No config file found, using built-in defaults");
    Ok(ProbeConfig::default())
}

fn apply_run_overrides(config: &mut ProbeConfig, run: &RunArgs) {
    if let Some(period) = run.period {
        config.period = period;
    }
    if let Some(priority) = run.priority {
        config.realtime.priority = priority;
    }
    if let Some(policy) = run.policy {
        config.realtime.policy = policy;
    }
    if let Some(duration) = run.duration {
        config.duration = duration;
    }
    if run.forever {
        config.duration = Duration::ZERO;
    }
    if run.alert.is_some() {
        config.alert_threshold = run.alert;
    }
    match run.cpu.as_slice() {
        [] => {}
        [cpu] => config.realtime.cpu_affinity = Some(CpuAffinity::Single(*cpu)),
        cpus => config.realtime.cpu_affinity = Some(CpuAffinity::Set(cpus.to_vec())),
    }
    if run.no_reset {
        config.reset_on_start = false;
    }
    if run.no_rt {
        config.realtime.enabled = false;
    }
    if let Some(device) = &run.serial {
        let serial = config.payload.serial.get_or_insert_with(SerialConfig::default);
        serial.device.clone_from(device);
    }
    if run.loopback {
        config.payload.loopback = true;
        config.recording = RecordingMode::Secondary;
    }
}

fn run_probe(config: ProbeConfig, json: bool) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        period = %humantime::format_duration(config.period),
        duration = %humantime::format_duration(config.duration),
        policy = ?config.realtime.policy,
        priority = config.realtime.priority,
        "Starting latency probe"
    );

    let probe = Probe::new(config).context("Invalid configuration")?;
    let shutdown = ShutdownFlag::new();
    let signal_handler =
        SignalHandler::install(shutdown.clone()).context("Failed to set up signal handlers")?;

    let outcome = probe.run(shutdown).context("Latency probe failed")?;

    if signal_handler.state().signal_count() > 0 {
        info!(
            signal = ?signal_handler.state().last_signal(),
            "Run interrupted"
        );
    }
    print_outcome(&outcome, json)
}

fn print_outcome(outcome: &ProbeOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else {
        println!("{}", outcome.report);
    }
    info!(
        iterations = outcome.cyclic.iterations,
        alerts = outcome.cyclic.alerts,
        payload_errors = outcome.cyclic.payload_errors,
        "Probe finished"
    );
    Ok(())
}
