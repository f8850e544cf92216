//! Integration tests for rtlat acceptance testing.
//!
//! Simulated-clock scenarios run everywhere; shared memory tests skip when
//! `/dev/shm` is unavailable; real-time runs are ignored by default.

mod common;
mod latency_test;
mod shm_test;
