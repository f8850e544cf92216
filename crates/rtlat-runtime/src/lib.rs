#![doc = "Measuring engine for rtlat: cyclic wake-up loop, shared metrics store, and real-time setup."]

pub mod clock;
pub mod cyclic;
pub mod environment;
pub mod payload;
pub mod probe;
pub mod realtime;
pub mod secondary;
pub mod shm;

pub use clock::*;
pub use cyclic::*;
pub use environment::*;
pub use payload::*;
pub use probe::{run, AlertSink, Probe, ProbeOutcome};
pub use realtime::*;
pub use secondary::*;
pub use shm::*;
