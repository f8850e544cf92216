//! Host tuning applied around a measurement run.
//!
//! [`KernelTuning`] overrides kernel tunables (backing up the old values),
//! optionally holds `/dev/cpu_dma_latency` open with a latency target so CPUs
//! stay out of deep idle states, and on restore undoes all of it and drops
//! the process memory lock.

use crate::realtime;
use rtlat_common::config::EnvironmentConfig;
use rtlat_common::error::LatResult;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default PM QoS device.
pub const CPU_DMA_LATENCY_DEVICE: &str = "/dev/cpu_dma_latency";

/// Prepares the host before a run and undoes it afterwards.
pub trait EnvironmentPreparer: Send {
    /// Apply tuning.
    ///
    /// # Errors
    ///
    /// Returns an error only for failures that make a run meaningless;
    /// individual tunables that cannot be set are logged and skipped.
    fn prepare(&mut self) -> LatResult<()>;

    /// Undo whatever `prepare` changed. Safe to call more than once.
    fn restore(&mut self);
}

/// Leaves the host untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTuning;

impl EnvironmentPreparer for NoTuning {
    fn prepare(&mut self) -> LatResult<()> {
        Ok(())
    }

    fn restore(&mut self) {}
}

/// Kernel tunables plus the DMA latency request.
#[derive(Debug)]
pub struct KernelTuning {
    config: EnvironmentConfig,
    dma_device: PathBuf,
    unlock_memory: bool,
    dma_handle: Option<File>,
    backups: Vec<(PathBuf, String)>,
}

impl KernelTuning {
    /// Tuning described by `config`.
    #[must_use]
    pub fn new(config: EnvironmentConfig) -> Self {
        Self {
            config,
            dma_device: PathBuf::from(CPU_DMA_LATENCY_DEVICE),
            unlock_memory: false,
            dma_handle: None,
            backups: Vec::new(),
        }
    }

    /// Use another device node for the DMA latency request.
    #[must_use]
    pub fn with_dma_device(mut self, path: impl Into<PathBuf>) -> Self {
        self.dma_device = path.into();
        self
    }

    /// Call `munlockall` on restore.
    #[must_use]
    pub fn unlock_memory_on_restore(mut self, enabled: bool) -> Self {
        self.unlock_memory = enabled;
        self
    }

    /// Returns true while the DMA latency request is held.
    #[must_use]
    pub fn holds_dma_latency(&self) -> bool {
        self.dma_handle.is_some()
    }

    fn request_dma_latency(&mut self) {
        let target = self.config.latency_target_us;
        let opened = OpenOptions::new().write(true).open(&self.dma_device);
        let result = opened.and_then(|mut file| {
            file.write_all(&target.to_ne_bytes())?;
            Ok(file)
        });

        match result {
            Ok(file) => {
                info!(
                    device = %self.dma_device.display(),
                    target_us = target,
                    "CPU DMA latency request held"
                );
                self.dma_handle = Some(file);
            }
            Err(e) => warn!(
                device = %self.dma_device.display(),
                error = %e,
                "Cannot request CPU DMA latency"
            ),
        }
    }

    fn override_var(&mut self, name: &str, value: &str) {
        let path = self.config.kernel_dir.join(name);
        let original = match fs::read_to_string(&path) {
            Ok(original) => original,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Kernel tunable not available");
                return;
            }
        };

        match write_var(&path, value) {
            Ok(()) => {
                debug!(
                    path = %path.display(),
                    old = original.trim(),
                    new = value,
                    "Kernel tunable set"
                );
                self.backups.push((path, original));
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Cannot set kernel tunable"),
        }
    }
}

fn write_var(path: &Path, value: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
    file.write_all(value.as_bytes())
}

impl EnvironmentPreparer for KernelTuning {
    fn prepare(&mut self) -> LatResult<()> {
        if self.config.cpu_dma_latency {
            self.request_dma_latency();
        }

        let vars: Vec<(String, String)> = self
            .config
            .kernel_vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (name, value) in &vars {
            self.override_var(name, value);
        }

        info!(
            tunables = self.backups.len(),
            dma_latency = self.holds_dma_latency(),
            "Environment prepared"
        );
        Ok(())
    }

    fn restore(&mut self) {
        while let Some((path, original)) = self.backups.pop() {
            match write_var(&path, &original) {
                Ok(()) => debug!(path = %path.display(), "Kernel tunable restored"),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot restore kernel tunable");
                }
            }
        }

        if self.dma_handle.take().is_some() {
            debug!("CPU DMA latency request released");
        }

        if self.unlock_memory {
            realtime::unlock_memory();
        }
    }
}
