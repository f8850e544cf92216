//! Real-time setup for the measuring threads.
//!
//! Split in two halves: [`init_process`] runs once before any measuring thread
//! exists (capability check, `mlockall`), [`init_thread`] runs first thing on
//! each measuring thread (stack pre-fault, scheduler, CPU pinning).
//!
//! Without `fail_fast`, missing privileges degrade to a warning and the run
//! measures whatever the default scheduler delivers.

#![allow(unused_imports)] // non-Linux builds compile the fallbacks only

use rtlat_common::config::{CpuAffinity, RealtimeConfig, SchedPolicy};
use rtlat_common::error::{LatError, LatResult};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Highest priority accepted by `SCHED_FIFO` and `SCHED_RR`.
const MAX_RT_PRIORITY: u8 = 99;

/// Largest stack area [`init_thread`] will touch.
const MAX_PREFAULT: usize = 8 * 1024 * 1024;

/// Stack bytes touched per recursion step; one page on common platforms.
const PREFAULT_FRAME: usize = 4096;

/// What [`init_process`] achieved.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessRtStatus {
    /// `mlockall` succeeded.
    pub memory_locked: bool,
}

/// What [`init_thread`] achieved on the calling thread.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ThreadRtStatus {
    /// Bytes of stack touched.
    pub stack_prefaulted: usize,
    /// Policy in effect, when it was set.
    pub scheduler_policy: Option<SchedPolicy>,
    /// RT priority in effect, when one applies.
    pub scheduler_priority: Option<u8>,
    /// CPUs the thread is pinned to.
    pub cpu_affinity: Option<Vec<usize>>,
}

/// Process-wide setup. Call before spawning the measuring threads.
///
/// # Errors
///
/// With `fail_fast`, returns [`LatError::Scheduling`] when the process lacks
/// what the configuration asks for. Without it, only unexpected `mlockall`
/// failures are errors.
pub fn init_process(config: &RealtimeConfig) -> LatResult<ProcessRtStatus> {
    if !config.enabled {
        info!("Real-time setup disabled in configuration");
        return Ok(ProcessRtStatus::default());
    }

    if config.fail_fast {
        validate_rt_capabilities(config)?;
    }

    let memory_locked = config.lock_memory && lock_memory(config.fail_fast)?;
    Ok(ProcessRtStatus { memory_locked })
}

/// Per-thread setup for the calling thread.
///
/// The thread's stack must be larger than `prefault_stack_size`.
///
/// # Errors
///
/// Returns [`LatError::Scheduling`] when the policy or affinity cannot be
/// applied and `fail_fast` is set, and [`LatError::Config`] for a CPU index
/// the kernel cannot represent.
pub fn init_thread(config: &RealtimeConfig, name: &str) -> LatResult<ThreadRtStatus> {
    if !config.enabled {
        return Ok(ThreadRtStatus::default());
    }

    let stack_prefaulted = prefault_stack(config.prefault_stack_size);
    let (scheduler_policy, scheduler_priority) =
        set_scheduler(config.policy, config.priority, config.fail_fast)?;
    let cpu_affinity = set_cpu_affinity(config.cpu_affinity.as_ref(), config.fail_fast)?;

    let status = ThreadRtStatus {
        stack_prefaulted,
        scheduler_policy,
        scheduler_priority,
        cpu_affinity,
    };
    info!(thread = name, ?status, "Measuring thread configured");
    Ok(status)
}

#[cfg(target_os = "linux")]
fn lock_memory(fail_fast: bool) -> LatResult<bool> {
    use nix::errno::Errno;
    use nix::sys::mman::{mlockall, MlockAllFlags};

    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => {
            info!("Process memory locked");
            Ok(true)
        }
        Err(Errno::EPERM | Errno::ENOMEM) if !fail_fast => {
            warn!("mlockall not permitted; page faults may show up as latency");
            Ok(false)
        }
        Err(e) => Err(LatError::Scheduling(format!("mlockall: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn lock_memory(_fail_fast: bool) -> LatResult<bool> {
    warn!("mlockall not available on this platform");
    Ok(false)
}

/// Release the process-wide memory lock.
pub fn unlock_memory() {
    #[cfg(target_os = "linux")]
    match nix::sys::mman::munlockall() {
        Ok(()) => debug!("Process memory unlocked"),
        Err(e) => warn!(error = %e, "munlockall failed"),
    }
}

/// Touch up to `size` bytes of the calling thread's stack.
///
/// Returns the number of bytes touched, a whole number of frames.
fn prefault_stack(size: usize) -> usize {
    let frames = size.min(MAX_PREFAULT) / PREFAULT_FRAME;
    if frames == 0 {
        return 0;
    }
    let touched = touch_stack_frames(frames) * PREFAULT_FRAME;
    debug!(bytes = touched, "Stack pre-faulted");
    touched
}

/// Each call owns one frame-sized local that gets written, then recurses.
#[inline(never)]
fn touch_stack_frames(frames: usize) -> usize {
    if frames == 0 {
        return 0;
    }
    let mut frame = [0u8; PREFAULT_FRAME];
    // SAFETY: index 0 and PREFAULT_FRAME - 1 are inside `frame`
    unsafe {
        std::ptr::write_volatile(frame.as_mut_ptr(), 1);
        std::ptr::write_volatile(frame.as_mut_ptr().add(PREFAULT_FRAME - 1), 1);
    }
    std::hint::black_box(&frame);
    1 + touch_stack_frames(frames - 1)
}

#[cfg(target_os = "linux")]
fn set_scheduler(
    policy: SchedPolicy,
    priority: u8,
    fail_fast: bool,
) -> LatResult<(Option<SchedPolicy>, Option<u8>)> {
    let native = match policy {
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::Rr => libc::SCHED_RR,
        SchedPolicy::Other => return Ok((Some(SchedPolicy::Other), None)),
    };

    let effective = priority.clamp(1, MAX_RT_PRIORITY);
    if effective != priority {
        warn!(requested = priority, effective, "RT priority out of range");
    }
    let param = libc::sched_param {
        sched_priority: i32::from(effective),
    };

    // SAFETY: pid 0 is the calling thread; param outlives the call
    if unsafe { libc::sched_setscheduler(0, native, &param) } == 0 {
        debug!(?policy, priority = effective, "Scheduler set");
        return Ok((Some(policy), Some(effective)));
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EPERM) && !fail_fast {
        warn!(?policy, "No permission for RT scheduling; measuring under SCHED_OTHER");
        return Ok((None, None));
    }
    Err(LatError::Scheduling(format!(
        "sched_setscheduler({policy:?}, {effective}): {err}"
    )))
}

#[cfg(not(target_os = "linux"))]
fn set_scheduler(
    policy: SchedPolicy,
    _priority: u8,
    _fail_fast: bool,
) -> LatResult<(Option<SchedPolicy>, Option<u8>)> {
    warn!(?policy, "RT scheduling not available on this platform");
    Ok((None, None))
}

#[cfg(target_os = "linux")]
fn set_cpu_affinity(
    affinity: Option<&CpuAffinity>,
    fail_fast: bool,
) -> LatResult<Option<Vec<usize>>> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let cpus = match affinity.map(CpuAffinity::cpus) {
        Some(cpus) if !cpus.is_empty() => cpus,
        _ => return Ok(None),
    };

    let mut set = CpuSet::new();
    for &cpu in &cpus {
        set.set(cpu)
            .map_err(|e| LatError::Config(format!("CPU {cpu} cannot be pinned: {e}")))?;
    }

    match sched_setaffinity(Pid::from_raw(0), &set) {
        Ok(()) => {
            debug!(?cpus, "Thread pinned");
            Ok(Some(cpus))
        }
        Err(e) if !fail_fast => {
            warn!(?cpus, error = %e, "CPU pinning failed; thread may migrate");
            Ok(None)
        }
        Err(e) => Err(LatError::Scheduling(format!(
            "sched_setaffinity({cpus:?}): {e}"
        ))),
    }
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(
    affinity: Option<&CpuAffinity>,
    _fail_fast: bool,
) -> LatResult<Option<Vec<usize>>> {
    if affinity.is_some() {
        warn!("CPU pinning not available on this platform");
    }
    Ok(None)
}

/// Returns true when the effective user is root.
#[must_use]
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// What the process is allowed to do, as far as can be told up front.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RtCapabilities {
    /// Effective user is root.
    pub is_root: bool,
    /// Soft `RLIMIT_RTPRIO`.
    pub rtprio_limit: Option<u64>,
    /// Soft `RLIMIT_MEMLOCK`.
    pub memlock_limit: Option<u64>,
    /// The kernel reports itself as PREEMPT_RT.
    pub preempt_rt: bool,
}

impl RtCapabilities {
    /// Whether an RT policy at `priority` should be accepted.
    #[must_use]
    pub fn allows_priority(&self, priority: u8) -> bool {
        self.is_root || self.rtprio_limit.is_some_and(|l| l >= u64::from(priority.max(1)))
    }

    /// Whether `mlockall(MCL_FUTURE)` should be accepted.
    #[must_use]
    pub fn allows_memory_lock(&self) -> bool {
        self.is_root || self.memlock_limit == Some(libc::RLIM_INFINITY)
    }

    /// Requirements of `config` these capabilities do not meet.
    #[must_use]
    pub fn shortfalls(&self, config: &RealtimeConfig) -> Vec<String> {
        let mut missing = Vec::new();
        if config.policy != SchedPolicy::Other && !self.allows_priority(config.priority) {
            missing.push(format!(
                "{:?} priority {} needs root, CAP_SYS_NICE or RLIMIT_RTPRIO >= {} (have {:?})",
                config.policy, config.priority, config.priority, self.rtprio_limit
            ));
        }
        if config.lock_memory && !self.allows_memory_lock() {
            missing.push(format!(
                "memory locking needs root, CAP_IPC_LOCK or unlimited RLIMIT_MEMLOCK (have {:?})",
                self.memlock_limit
            ));
        }
        missing
    }
}

/// Probe privileges and kernel flavour.
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    let realtime_flag = Path::new("/sys/kernel/realtime");
    let version = Path::new("/proc/version");

    #[cfg(target_os = "linux")]
    {
        use nix::sys::resource::{getrlimit, Resource};
        RtCapabilities {
            is_root: is_root(),
            rtprio_limit: getrlimit(Resource::RLIMIT_RTPRIO).ok().map(|(soft, _)| soft),
            memlock_limit: getrlimit(Resource::RLIMIT_MEMLOCK).ok().map(|(soft, _)| soft),
            preempt_rt: kernel_is_preempt_rt(realtime_flag, version),
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        RtCapabilities {
            is_root: is_root(),
            preempt_rt: kernel_is_preempt_rt(realtime_flag, version),
            ..Default::default()
        }
    }
}

fn kernel_is_preempt_rt(realtime_flag: &Path, version: &Path) -> bool {
    if let Ok(flag) = std::fs::read_to_string(realtime_flag) {
        return flag.trim() == "1";
    }
    std::fs::read_to_string(version)
        .is_ok_and(|v| v.contains("PREEMPT_RT") || v.contains("PREEMPT RT"))
}

/// Refuse to start when the configuration asks for more than the process
/// may do.
///
/// # Errors
///
/// Returns [`LatError::Scheduling`] listing every unmet requirement.
pub fn validate_rt_capabilities(config: &RealtimeConfig) -> LatResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let caps = check_rt_capabilities();
    if !caps.preempt_rt {
        warn!("Kernel is not PREEMPT_RT; results describe a stock kernel");
    }

    let missing = caps.shortfalls(config);
    if missing.is_empty() {
        debug!(?caps, "Real-time capabilities sufficient");
        return Ok(());
    }

    let message = format!("insufficient real-time privileges: {}", missing.join("; "));
    error!(%message, "Refusing to start");
    Err(LatError::Scheduling(message))
}
