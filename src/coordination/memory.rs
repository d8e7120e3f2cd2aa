//! In-memory coordination store.
//!
//! Used in tests to simulate the shared plane between multiple server
//! instances running in one binary, and as a single-process fallback when
//! Redis is not configured. TTLs are enforced lazily on read.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::store::CoordinationStore;
use super::types::{CoordinationError, TopicMessage};

const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Default)]
pub struct InMemoryCoordinationStore {
    sets: Mutex<HashMap<String, HashSet<String>>>,
    values: Mutex<HashMap<String, ValueEntry>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

struct Subscriber {
    topics: Vec<String>,
    sender: mpsc::Sender<TopicMessage>,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), CoordinationError> {
        let senders: Vec<mpsc::Sender<TopicMessage>> = {
            let mut subscribers = self.subscribers.lock().expect("store lock poisoned");
            subscribers.retain(|s| !s.sender.is_closed());
            subscribers
                .iter()
                .filter(|s| s.topics.iter().any(|t| t == topic))
                .map(|s| s.sender.clone())
                .collect()
        };

        for sender in senders {
            let message = TopicMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            let _ = sender.send(message).await;
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[String],
    ) -> Result<mpsc::Receiver<TopicMessage>, CoordinationError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .lock()
            .expect("store lock poisoned")
            .push(Subscriber {
                topics: topics.to_vec(),
                sender: tx,
            });
        Ok(rx)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), CoordinationError> {
        self.sets
            .lock()
            .expect("store lock poisoned")
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), CoordinationError> {
        let mut sets = self.sets.lock().expect("store lock poisoned");
        if let Some(set) = sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                sets.remove(key);
            }
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CoordinationError> {
        Ok(self
            .sets
            .lock()
            .expect("store lock poisoned")
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), CoordinationError> {
        self.values.lock().expect("store lock poisoned").insert(
            key.to_string(),
            ValueEntry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        let mut values = self.values.lock().expect("store lock poisoned");
        match values.get(key) {
            Some(entry) if entry.is_expired() => {
                values.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CoordinationError> {
        self.values.lock().expect("store lock poisoned").remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CoordinationError> {
        let mut values = self.values.lock().expect("store lock poisoned");
        values.retain(|_, entry| !entry.is_expired());
        Ok(values
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CoordinationError> {
        if let Some(entry) = self
            .values
            .lock()
            .expect("store lock poisoned")
            .get_mut(key)
        {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_operations() {
        let store = InMemoryCoordinationStore::new();

        store.sadd("channels:t1:m", "c1").await.unwrap();
        store.sadd("channels:t1:m", "c2").await.unwrap();

        let mut members = store.smembers("channels:t1:m").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["c1", "c2"]);

        store.srem("channels:t1:m", "c1").await.unwrap();
        store.srem("channels:t1:m", "c2").await.unwrap();
        assert!(store.smembers("channels:t1:m").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = InMemoryCoordinationStore::new();

        store
            .set_with_ttl("presence:t1:u1", "{}".to_string(), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(store.get("presence:t1:u1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("presence:t1:u1").await.unwrap().is_none());
        assert!(store.scan_prefix("presence:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let store = InMemoryCoordinationStore::new();

        let mut matching = store.subscribe(&["topic-a".to_string()]).await.unwrap();
        let mut other = store.subscribe(&["topic-b".to_string()]).await.unwrap();

        store
            .publish("topic-a", "hello".to_string())
            .await
            .unwrap();

        let msg = matching.recv().await.unwrap();
        assert_eq!(msg.topic, "topic-a");
        assert_eq!(msg.payload, "hello");

        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_scan_prefix() {
        let store = InMemoryCoordinationStore::new();
        let ttl = Duration::from_secs(60);

        store
            .set_with_ttl("presence:t1:u1", "a".into(), ttl)
            .await
            .unwrap();
        store
            .set_with_ttl("presence:t1:u2", "b".into(), ttl)
            .await
            .unwrap();
        store
            .set_with_ttl("presence:t2:u3", "c".into(), ttl)
            .await
            .unwrap();

        let keys = store.scan_prefix("presence:t1:").await.unwrap();
        assert_eq!(keys.len(), 2);
    }
}
