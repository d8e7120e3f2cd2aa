//! Liveness monitor: detects silent connections and runs their full
//! disconnection path.

mod monitor;

pub use monitor::{LivenessMonitor, LivenessState, SweepOutcome};
