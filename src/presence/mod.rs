//! Presence: per-(tenant, user) online status, mirrored to the coordination
//! store with a TTL so it survives process restarts but expires naturally
//! when updates stop.

mod status;
mod tracker;

pub use status::PresenceStatus;
pub use tracker::{PresenceRecord, PresenceTracker};
