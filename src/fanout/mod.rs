//! Channel fan-out engine: delivers one envelope to every reachable
//! subscriber of a channel, locally and across the fleet.

mod engine;

pub use engine::{FanoutEngine, FanoutError, FanoutStatsSnapshot, SubscribeOutcome};
