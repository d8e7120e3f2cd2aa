//! Redis infrastructure: connection pool, reconnect backoff, and health
//! tracking for the coordination plane.

mod backoff;
mod health;
mod pool;

pub use backoff::ExponentialBackoff;
pub use health::{RedisHealth, RedisHealthStats, RedisHealthStatus};
pub use pool::{PoolError, RedisPool};

/// Current time in milliseconds since epoch
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
