//! Time sources for the measuring loop.
//!
//! [`MonotonicClock`] reads `CLOCK_MONOTONIC` and sleeps with
//! `clock_nanosleep(TIMER_ABSTIME)`, so a late wake-up never shifts later
//! deadlines. [`SimulatedClock`] replays scripted wake-up latencies for
//! deterministic tests.

use rtlat_common::time::{TimeArith, Timestamp};
use std::collections::VecDeque;

/// A monotonic time source with absolute sleeps.
pub trait Clock: Send {
    /// Current time.
    fn now(&self) -> Timestamp;

    /// Block until `deadline` has passed.
    fn sleep_until(&mut self, deadline: Timestamp);
}

/// The system monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl MonotonicClock {
    /// Create a handle to the system monotonic clock.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "linux")]
#[allow(clippy::cast_possible_truncation)]
fn to_timespec(ts: Timestamp) -> libc::timespec {
    libc::timespec {
        tv_sec: ts.sec as libc::time_t,
        tv_nsec: ts.nsec as libc::c_long,
    }
}

impl Clock for MonotonicClock {
    #[allow(clippy::useless_conversion)]
    fn now(&self) -> Timestamp {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: ts is a valid out-pointer and CLOCK_MONOTONIC always exists
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        Timestamp::new(i64::from(ts.tv_sec), i64::from(ts.tv_nsec))
    }

    #[cfg(target_os = "linux")]
    fn sleep_until(&mut self, deadline: Timestamp) {
        let target = to_timespec(deadline);
        loop {
            // SAFETY: target is a valid timespec; the remainder pointer may
            // be null for absolute sleeps
            let rc = unsafe {
                libc::clock_nanosleep(
                    libc::CLOCK_MONOTONIC,
                    libc::TIMER_ABSTIME,
                    &target,
                    std::ptr::null_mut(),
                )
            };
            // absolute deadline: retrying after a signal cannot oversleep
            if rc != libc::EINTR {
                break;
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn sleep_until(&mut self, deadline: Timestamp) {
        let remaining = TimeArith::Reference.diff_us(self.now(), deadline);
        if let Ok(us) = u64::try_from(remaining) {
            std::thread::sleep(std::time::Duration::from_micros(us));
        }
    }
}

/// A clock that jumps straight to each deadline plus a scripted latency.
///
/// The n-th call to `sleep_until` wakes `latencies[n]` µs late; once the
/// script runs out every wake-up is on time.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    now: Timestamp,
    latencies: VecDeque<i64>,
    sleeps: u64,
}

impl SimulatedClock {
    /// A clock starting at `start` that always wakes exactly on time.
    #[must_use]
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: start,
            latencies: VecDeque::new(),
            sleeps: 0,
        }
    }

    /// A clock whose successive wake-ups are late by `latencies` µs.
    #[must_use]
    pub fn with_latencies(start: Timestamp, latencies: impl IntoIterator<Item = i64>) -> Self {
        Self {
            latencies: latencies.into_iter().collect(),
            ..Self::new(start)
        }
    }

    /// Number of completed sleeps.
    #[must_use]
    pub fn sleeps(&self) -> u64 {
        self.sleeps
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Timestamp {
        self.now
    }

    fn sleep_until(&mut self, deadline: Timestamp) {
        let late = self.latencies.pop_front().unwrap_or(0);
        let wake = TimeArith::Reference.add_us(deadline, late);
        // never run backwards
        if wake > self.now {
            self.now = wake;
        }
        self.sleeps += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_is_normalized_and_non_decreasing() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(a.is_normalized());
        assert!(b >= a);
    }

    #[test]
    fn test_monotonic_sleep_reaches_deadline() {
        let mut clock = MonotonicClock::new();
        let deadline = clock.now().add_us(2_000);
        clock.sleep_until(deadline);
        assert!(clock.now() >= deadline);
    }

    #[test]
    fn test_monotonic_past_deadline_returns() {
        let mut clock = MonotonicClock::new();
        let past = clock.now().sub_us(1_000);
        clock.sleep_until(past);
        assert!(clock.now() > past);
    }

    #[test]
    fn test_simulated_scripted_latencies() {
        let mut clock = SimulatedClock::with_latencies(Timestamp::new(5, 0), [0, 250]);

        clock.sleep_until(Timestamp::new(5, 1_000_000));
        assert_eq!(clock.now(), Timestamp::new(5, 1_000_000));

        clock.sleep_until(Timestamp::new(5, 2_000_000));
        assert_eq!(clock.now(), Timestamp::new(5, 2_250_000));

        // script exhausted
        clock.sleep_until(Timestamp::new(5, 3_000_000));
        assert_eq!(clock.now(), Timestamp::new(5, 3_000_000));
        assert_eq!(clock.sleeps(), 3);
    }

    #[test]
    fn test_simulated_never_goes_backwards() {
        let mut clock = SimulatedClock::new(Timestamp::new(10, 0));
        clock.sleep_until(Timestamp::new(9, 0));
        assert_eq!(clock.now(), Timestamp::new(10, 0));
    }
}
