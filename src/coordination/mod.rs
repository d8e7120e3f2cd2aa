//! Coordination plane: shared key/value + pub/sub used for cross-process
//! fan-out, channel membership mirroring, and presence records.
//!
//! Cross-process state held here is informational or TTL-expiring; local
//! delivery never depends on it for correctness.

mod memory;
mod redis_store;
mod store;
mod subscriber;
mod types;

pub use memory::InMemoryCoordinationStore;
pub use redis_store::RedisCoordinationStore;
pub use store::CoordinationStore;
pub use subscriber::PeerSubscriber;
pub use types::{CoordinationError, PeerEvent, TopicMessage};
