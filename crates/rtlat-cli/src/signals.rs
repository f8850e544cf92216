//! Signal handling for clean shutdown of a measurement run.
//!
//! SIGINT and SIGTERM set an atomic flag from the async-signal context; a
//! small poll thread forwards it to the run's [`ShutdownFlag`], which the
//! cyclic loop checks at every iteration boundary.

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use rtlat_runtime::ShutdownFlag;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

static SIGNAL_PENDING: AtomicBool = AtomicBool::new(false);
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_shutdown_signal(signo: c_int) {
    LAST_SIGNAL.store(signo, Ordering::Relaxed);
    SIGNAL_PENDING.store(true, Ordering::Relaxed);
}

/// Counters kept by the handler.
#[derive(Debug, Default)]
pub struct SignalState {
    signal_count: AtomicU32,
    last_signal: AtomicI32,
}

impl SignalState {
    fn record(&self, signo: i32) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
        self.last_signal.store(signo, Ordering::Relaxed);
    }

    /// Number of shutdown signals received.
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Relaxed)
    }

    /// The most recent signal, if any.
    pub fn last_signal(&self) -> Option<Signal> {
        match self.last_signal.load(Ordering::Relaxed) {
            0 => None,
            signo => Signal::try_from(signo).ok(),
        }
    }
}

/// Forwards SIGINT/SIGTERM to a [`ShutdownFlag`].
pub struct SignalHandler {
    state: Arc<SignalState>,
    shutdown: ShutdownFlag,
}

impl SignalHandler {
    /// Install the handlers and start forwarding to `shutdown`.
    ///
    /// The poll thread exits once `shutdown` is raised, by a signal or by
    /// the loop itself.
    pub fn install(shutdown: ShutdownFlag) -> std::io::Result<Self> {
        let handler = Self {
            state: Arc::new(SignalState::default()),
            shutdown,
        };

        let action = SigAction::new(
            SigHandler::Handler(on_shutdown_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for sig in [Signal::SIGINT, Signal::SIGTERM] {
            // SAFETY: the handler only stores to atomics, which is async-signal-safe
            unsafe { signal::sigaction(sig, &action) }.map_err(std::io::Error::from)?;
        }

        let state = Arc::clone(&handler.state);
        let flag = handler.shutdown.clone();
        std::thread::Builder::new()
            .name("rtlat-signals".into())
            .spawn(move || loop {
                if SIGNAL_PENDING.swap(false, Ordering::Relaxed) {
                    let signo = LAST_SIGNAL.load(Ordering::Relaxed);
                    state.record(signo);
                    info!(signal = signo, "Shutdown signal received");
                    flag.request();
                }
                if flag.is_requested() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            })?;

        debug!("Signal handlers registered");
        Ok(handler)
    }

    /// Get the signal state for inspection.
    pub fn state(&self) -> &SignalState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_state_default() {
        let state = SignalState::default();
        assert_eq!(state.signal_count(), 0);
        assert!(state.last_signal().is_none());

        state.record(Signal::SIGTERM as i32);
        assert_eq!(state.signal_count(), 1);
        assert_eq!(state.last_signal(), Some(Signal::SIGTERM));
    }

    #[test]
    fn test_sigterm_raises_shutdown() {
        let shutdown = ShutdownFlag::new();
        let handler = SignalHandler::install(shutdown.clone()).unwrap();
        assert!(!shutdown.is_requested());

        signal::raise(Signal::SIGTERM).unwrap();

        for _ in 0..200 {
            if shutdown.is_requested() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(shutdown.is_requested());
        assert_eq!(handler.state().signal_count(), 1);
        assert_eq!(handler.state().last_signal(), Some(Signal::SIGTERM));
    }
}
