use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::channel::{ChannelError, ChannelName};
use crate::config::CoordinationConfig;
use crate::coordination::{CoordinationStore, PeerEvent};
use crate::events::{EventBus, EventListener, RealtimeEvent};
use crate::metrics::FanoutMetrics;
use crate::protocol::{Envelope, CLOSE_SLOW_CONSUMER};
use crate::registry::{ConnectionHandle, ConnectionRegistry, OutboundError};

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("Connection {0} not found")]
    ConnectionNotFound(Uuid),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl FanoutError {
    pub fn is_forbidden(&self) -> bool {
        matches!(self, FanoutError::Channel(ChannelError::Forbidden { .. }))
    }
}

/// Result of a successful subscribe call.
#[derive(Debug, Clone)]
pub struct SubscribeOutcome {
    pub channel: ChannelName,
    /// Local subscriber count after the subscribe.
    pub subscribers: usize,
}

#[derive(Debug, Default)]
struct FanoutStats {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    peer_delivered: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FanoutStatsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub peer_delivered: u64,
}

/// Resolves a channel to its local subscribers and mirrors membership and
/// publishes to the coordination plane so peer instances reach theirs.
pub struct FanoutEngine {
    config: CoordinationConfig,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn CoordinationStore>,
    events: Arc<EventBus>,
    /// channel -> local subscriber connection ids; authoritative for local
    /// delivery, mirrored to the store only for observability
    channels: DashMap<ChannelName, HashSet<Uuid>>,
    stats: FanoutStats,
}

impl FanoutEngine {
    pub fn new(
        config: CoordinationConfig,
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn CoordinationStore>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            events,
            channels: DashMap::new(),
            stats: FanoutStats::default(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    /// Subscribe a connection to a channel.
    ///
    /// The raw name is qualified against the connection's tenant before any
    /// state changes; a tenant mismatch rejects the call outright.
    #[tracing::instrument(
        name = "fanout.subscribe",
        skip(self),
        fields(connection_id = %connection_id)
    )]
    pub async fn subscribe(
        &self,
        connection_id: Uuid,
        raw_channel: &str,
    ) -> Result<SubscribeOutcome, FanoutError> {
        let conn = self
            .registry
            .get(connection_id)
            .ok_or(FanoutError::ConnectionNotFound(connection_id))?;

        let channel = ChannelName::qualify(raw_channel, &conn.tenant_id).inspect_err(|e| {
            tracing::warn!(
                connection_id = %connection_id,
                tenant_id = %conn.tenant_id,
                raw_channel = %raw_channel,
                error = %e,
                "Subscribe rejected"
            );
            FanoutMetrics::record_subscribe_rejected();
        })?;

        let subscribers = {
            let mut entry = self.channels.entry(channel.clone()).or_default();
            entry.insert(connection_id);
            entry.len()
        };
        conn.subscriptions.write().await.insert(channel.clone());

        // Informational mirror; local delivery never reads it
        if let Err(e) = self
            .store
            .sadd(
                &self.config.channel_members_key(channel.as_str()),
                &connection_id.to_string(),
            )
            .await
        {
            tracing::warn!(channel = %channel, error = %e, "Failed to mirror channel membership");
        }

        tracing::debug!(
            connection_id = %connection_id,
            channel = %channel,
            subscribers = subscribers,
            "Subscribed to channel"
        );

        self.events
            .emit(RealtimeEvent::ChannelSubscribed {
                connection: conn,
                channel: channel.clone(),
            })
            .await;

        Ok(SubscribeOutcome {
            channel,
            subscribers,
        })
    }

    /// Unsubscribe a connection from a channel. Idempotent; removing the
    /// last subscriber drops the local channel entry.
    #[tracing::instrument(
        name = "fanout.unsubscribe",
        skip(self),
        fields(connection_id = %connection_id)
    )]
    pub async fn unsubscribe(
        &self,
        connection_id: Uuid,
        raw_channel: &str,
    ) -> Result<ChannelName, FanoutError> {
        let conn = self
            .registry
            .get(connection_id)
            .ok_or(FanoutError::ConnectionNotFound(connection_id))?;

        let channel = ChannelName::qualify(raw_channel, &conn.tenant_id)?;

        let removed = self.remove_local_subscription(&channel, connection_id);
        conn.subscriptions.write().await.remove(&channel);

        if removed {
            if let Err(e) = self
                .store
                .srem(
                    &self.config.channel_members_key(channel.as_str()),
                    &connection_id.to_string(),
                )
                .await
            {
                tracing::warn!(channel = %channel, error = %e, "Failed to update channel membership");
            }

            tracing::debug!(
                connection_id = %connection_id,
                channel = %channel,
                "Unsubscribed from channel"
            );

            self.events
                .emit(RealtimeEvent::ChannelUnsubscribed {
                    connection: conn,
                    channel: channel.clone(),
                })
                .await;
        }

        Ok(channel)
    }

    /// Remove a connection from the local channel table, garbage-collecting
    /// the entry when it empties. Returns whether anything was removed.
    fn remove_local_subscription(&self, channel: &ChannelName, connection_id: Uuid) -> bool {
        let Some(mut entry) = self.channels.get_mut(channel) else {
            return false;
        };
        let removed = entry.remove(&connection_id);
        let emptied = entry.is_empty();
        drop(entry);
        if emptied {
            self.channels.remove_if(channel, |_, conns| conns.is_empty());
        }
        removed
    }

    /// Deliver an envelope to this process's local subscribers only.
    pub async fn publish_local(&self, channel: &ChannelName, envelope: Arc<Envelope>) -> usize {
        let Some(ids) = self
            .channels
            .get(channel)
            .map(|entry| entry.iter().copied().collect::<Vec<_>>())
        else {
            return 0;
        };

        let connections: Vec<_> = ids.iter().filter_map(|id| self.registry.get(*id)).collect();
        self.deliver(&connections, &envelope)
    }

    /// Publish an envelope fleet-wide: local subscribers directly, peer
    /// instances via the coordination plane.
    #[tracing::instrument(
        name = "fanout.publish",
        skip(self, envelope),
        fields(channel = %channel, envelope_id = %envelope.id)
    )]
    pub async fn publish(&self, channel: &ChannelName, envelope: Arc<Envelope>) -> usize {
        let delivered = self.publish_local(channel, envelope.clone()).await;

        self.stats.published.fetch_add(1, Ordering::Relaxed);
        FanoutMetrics::record_published("channel");

        let event = PeerEvent::Channel {
            channel: channel.clone(),
            envelope: (*envelope).clone(),
            origin: self.config.server_id.clone(),
        };
        self.publish_peer_event(&self.config.channel_topic(), &event)
            .await;

        tracing::debug!(
            channel = %channel,
            delivered = delivered,
            "Published envelope to channel"
        );

        delivered
    }

    /// Broadcast to every connection of a tenant, fleet-wide.
    pub async fn broadcast_to_tenant(&self, tenant_id: &str, envelope: Arc<Envelope>) -> usize {
        let connections = self.registry.connections_for_tenant(tenant_id);
        let delivered = self.deliver(&connections, &envelope);

        self.stats.published.fetch_add(1, Ordering::Relaxed);
        FanoutMetrics::record_published("tenant");

        let event = PeerEvent::Tenant {
            tenant_id: tenant_id.to_string(),
            envelope: (*envelope).clone(),
            origin: self.config.server_id.clone(),
        };
        self.publish_peer_event(&self.config.tenant_topic(), &event)
            .await;

        delivered
    }

    /// Send to every connection of one user within a tenant, fleet-wide.
    pub async fn send_to_user(
        &self,
        tenant_id: &str,
        user_id: &str,
        envelope: Arc<Envelope>,
    ) -> usize {
        let connections = self.registry.connections_for_user(tenant_id, user_id);
        let delivered = self.deliver(&connections, &envelope);

        self.stats.published.fetch_add(1, Ordering::Relaxed);
        FanoutMetrics::record_published("user");

        let event = PeerEvent::User {
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
            envelope: (*envelope).clone(),
            origin: self.config.server_id.clone(),
        };
        self.publish_peer_event(&self.config.user_topic(), &event)
            .await;

        delivered
    }

    /// Deliver an event published by a peer instance to local connections.
    pub async fn deliver_peer_event(&self, event: PeerEvent) -> usize {
        let delivered = match event {
            PeerEvent::Channel {
                channel, envelope, ..
            } => self.publish_local(&channel, envelope.shared()).await,
            PeerEvent::Tenant {
                tenant_id,
                envelope,
                ..
            } => {
                let connections = self.registry.connections_for_tenant(&tenant_id);
                self.deliver(&connections, &envelope.shared())
            }
            PeerEvent::User {
                tenant_id,
                user_id,
                envelope,
                ..
            } => {
                let connections = self.registry.connections_for_user(&tenant_id, &user_id);
                self.deliver(&connections, &envelope.shared())
            }
        };

        self.stats
            .peer_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Deliver one shared envelope to a set of connections.
    ///
    /// A failed enqueue disconnects that one connection without aborting
    /// delivery to the rest: stale data beats blocking the fan-out loop.
    fn deliver(&self, connections: &[Arc<ConnectionHandle>], envelope: &Arc<Envelope>) -> usize {
        let mut delivered = 0;

        for conn in connections {
            match conn.enqueue(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    FanoutMetrics::record_dropped();
                    tracing::warn!(
                        connection_id = %conn.id,
                        error = %err,
                        "Delivery failed, disconnecting connection"
                    );
                    if err == OutboundError::QueueFull {
                        conn.request_close(CLOSE_SLOW_CONSUMER, "outbound queue overflow");
                    }
                    // Run the disconnection path off the fan-out loop
                    let registry = self.registry.clone();
                    let id = conn.id;
                    tokio::spawn(async move {
                        registry.remove(id).await;
                    });
                }
            }
        }

        self.stats
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        FanoutMetrics::record_delivered(delivered as u64);
        delivered
    }

    async fn publish_peer_event(&self, topic: &str, event: &PeerEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize peer event");
                return;
            }
        };

        // Cross-process fan-out is best-effort: a store outage loses this
        // publish for remote subscribers but never blocks local clients.
        if let Err(e) = self.store.publish(topic, payload).await {
            tracing::error!(
                topic = %topic,
                error = %e,
                "Coordination store publish failed, peer fan-out lost"
            );
        }
    }

    /// Local subscriber count for a channel.
    pub fn local_subscribers(&self, channel: &ChannelName) -> usize {
        self.channels.get(channel).map(|e| e.len()).unwrap_or(0)
    }

    /// Whether a channel currently exists locally.
    pub fn has_channel(&self, channel: &ChannelName) -> bool {
        self.channels.contains_key(channel)
    }

    /// Number of channels with at least one local subscriber.
    pub fn active_channels(&self) -> usize {
        self.channels.len()
    }

    /// Re-assert the TTL on mirrored channel membership sets.
    ///
    /// The mirror is best-effort observability; entries left behind by a
    /// crashed instance drift until their TTL lapses, never longer.
    pub async fn refresh_membership_mirrors(&self) -> usize {
        let keys: Vec<String> = self
            .channels
            .iter()
            .map(|entry| self.config.channel_members_key(entry.key().as_str()))
            .collect();

        let mut refreshed = 0;
        for key in keys {
            match self.store.expire(&key, self.config.mirror_ttl()).await {
                Ok(()) => refreshed += 1,
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "Failed to refresh membership mirror");
                }
            }
        }
        refreshed
    }

    pub fn stats(&self) -> FanoutStatsSnapshot {
        FanoutStatsSnapshot {
            published: self.stats.published.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            peer_delivered: self.stats.peer_delivered.load(Ordering::Relaxed),
        }
    }

    /// Drop a connection from every local channel entry and the mirrored
    /// membership sets. Part of the disconnection path.
    async fn purge_connection(&self, connection: &Arc<ConnectionHandle>) {
        let subscriptions: Vec<ChannelName> = connection
            .subscriptions
            .read()
            .await
            .iter()
            .cloned()
            .collect();

        for channel in subscriptions {
            self.remove_local_subscription(&channel, connection.id);

            if let Err(e) = self
                .store
                .srem(
                    &self.config.channel_members_key(channel.as_str()),
                    &connection.id.to_string(),
                )
                .await
            {
                tracing::debug!(
                    channel = %channel,
                    error = %e,
                    "Failed to update channel membership during disconnect"
                );
            }
        }
    }
}

impl From<FanoutError> for crate::error::AppError {
    fn from(e: FanoutError) -> Self {
        use crate::error::AppError;
        match &e {
            FanoutError::ConnectionNotFound(_) => AppError::NotFound(e.to_string()),
            FanoutError::Channel(ChannelError::Forbidden { .. }) => {
                AppError::Forbidden(e.to_string())
            }
            FanoutError::Channel(ChannelError::InvalidName(_)) => {
                AppError::Validation(e.to_string())
            }
        }
    }
}

#[async_trait]
impl EventListener for FanoutEngine {
    async fn on_event(&self, event: &RealtimeEvent) {
        if let RealtimeEvent::ClientDisconnected { connection } = event {
            self.purge_connection(connection).await;
        }
    }
}
