use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{CoordinationError, TopicMessage};

/// Shared key/value + pub/sub service used for cross-process coordination.
///
/// The production backend is Redis; tests share one in-memory store between
/// simulated server instances.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Publish a payload on a topic, reaching every subscribed process.
    async fn publish(&self, topic: &str, payload: String) -> Result<(), CoordinationError>;

    /// Subscribe to topics. Messages arrive on the returned receiver until
    /// it is dropped; backends reconnect transparently.
    async fn subscribe(
        &self,
        topics: &[String],
    ) -> Result<mpsc::Receiver<TopicMessage>, CoordinationError>;

    /// Add a member to a shared set.
    async fn sadd(&self, key: &str, member: &str) -> Result<(), CoordinationError>;

    /// Remove a member from a shared set.
    async fn srem(&self, key: &str, member: &str) -> Result<(), CoordinationError>;

    /// Read all members of a shared set.
    async fn smembers(&self, key: &str) -> Result<Vec<String>, CoordinationError>;

    /// Store a value with a TTL.
    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), CoordinationError>;

    /// Read a value; `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, CoordinationError>;

    /// Delete a key.
    async fn delete(&self, key: &str) -> Result<(), CoordinationError>;

    /// List keys under a prefix.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CoordinationError>;

    /// Refresh the TTL of a key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CoordinationError>;
}
