//! Redis-backed coordination store.
//!
//! Commands run over the shared multiplexed pool; each subscription gets a
//! dedicated pub/sub connection with automatic reconnection, since Redis
//! pub/sub cannot share a command connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::mpsc;

use crate::infrastructure::redis::{ExponentialBackoff, PoolError, RedisPool};

use super::store::CoordinationStore;
use super::types::{CoordinationError, TopicMessage};

const SUBSCRIBER_BUFFER: usize = 256;

pub struct RedisCoordinationStore {
    pool: Arc<RedisPool>,
}

impl RedisCoordinationStore {
    pub fn new(pool: Arc<RedisPool>) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, CoordinationError> {
        self.pool
            .get_connection()
            .await
            .map_err(CoordinationError::from)
    }

    /// Invalidate the pooled connection after a command-level failure so the
    /// next operation reconnects.
    async fn fail(&self, e: redis::RedisError) -> CoordinationError {
        if e.is_connection_dropped() || e.is_io_error() {
            self.pool.invalidate().await;
        }
        CoordinationError::Unavailable(e.to_string())
    }
}

impl From<PoolError> for CoordinationError {
    fn from(e: PoolError) -> Self {
        CoordinationError::Unavailable(e.to_string())
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), CoordinationError> {
        let mut conn = self.connection().await?;
        match conn.publish::<_, _, ()>(topic, payload).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn subscribe(
        &self,
        topics: &[String],
    ) -> Result<mpsc::Receiver<TopicMessage>, CoordinationError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let url = self.pool.url().to_string();
        let topics = topics.to_vec();

        tokio::spawn(async move {
            subscription_loop(url, topics, tx).await;
        });

        Ok(rx)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), CoordinationError> {
        let mut conn = self.connection().await?;
        match conn.sadd::<_, _, ()>(key, member).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), CoordinationError> {
        let mut conn = self.connection().await?;
        match conn.srem::<_, _, ()>(key, member).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CoordinationError> {
        let mut conn = self.connection().await?;
        match conn.smembers::<_, Vec<String>>(key).await {
            Ok(members) => Ok(members),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), CoordinationError> {
        let mut conn = self.connection().await?;
        match conn
            .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        let mut conn = self.connection().await?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CoordinationError> {
        let mut conn = self.connection().await?;
        match conn.del::<_, ()>(key).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CoordinationError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", prefix);
        let result: Result<Vec<String>, redis::RedisError> = redis::cmd("KEYS")
            .arg(&pattern)
            .query_async(&mut conn)
            .await;
        match result {
            Ok(keys) => Ok(keys),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CoordinationError> {
        let mut conn = self.connection().await?;
        match conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }
}

/// Dedicated pub/sub connection loop with exponential-backoff reconnection.
///
/// Ends when the receiver side is dropped.
async fn subscription_loop(url: String, topics: Vec<String>, tx: mpsc::Sender<TopicMessage>) {
    let mut backoff = ExponentialBackoff::new();

    loop {
        match run_subscription(&url, &topics, &tx, &mut backoff).await {
            Ok(()) => {
                tracing::info!(topics = ?topics, "Coordination subscription closed");
                break;
            }
            Err(e) => {
                if tx.is_closed() {
                    break;
                }
                let delay = backoff.next_delay();
                tracing::error!(
                    error = %e,
                    retry_delay_ms = delay.as_millis() as u64,
                    "Coordination subscription error, reconnecting"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn run_subscription(
    url: &str,
    topics: &[String],
    tx: &mpsc::Sender<TopicMessage>,
    backoff: &mut ExponentialBackoff,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Pub/sub requires a dedicated connection
    let client = redis::Client::open(url)?;
    let mut pubsub = client.get_async_pubsub().await?;

    for topic in topics {
        pubsub.subscribe(topic).await?;
    }
    backoff.reset();

    tracing::info!(topics = ?topics, "Coordination subscription established");

    let mut message_stream = pubsub.on_message();

    while let Some(msg) = message_stream.next().await {
        let topic = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, topic = %topic, "Failed to read message payload");
                continue;
            }
        };

        if tx.send(TopicMessage { topic, payload }).await.is_err() {
            // Receiver dropped, subscription no longer wanted
            return Ok(());
        }
    }

    Err("Message stream ended".into())
}
