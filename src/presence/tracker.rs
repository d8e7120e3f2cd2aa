use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::channel::ChannelName;
use crate::config::{CoordinationConfig, PresenceConfig};
use crate::coordination::CoordinationStore;
use crate::events::{EventListener, RealtimeEvent};
use crate::fanout::FanoutEngine;
use crate::metrics::PresenceMetrics;
use crate::protocol::Envelope;
use crate::registry::ConnectionRegistry;

use super::PresenceStatus;

/// Presence state of one user within one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub tenant_id: String,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
    pub channels: Vec<ChannelName>,
}

/// Tracks presence locally and mirrors it to the coordination store.
///
/// The owning process has the freshest data; other processes read the
/// mirrored records, which expire on their TTL when updates stop.
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn CoordinationStore>,
    fanout: Arc<FanoutEngine>,
    config: PresenceConfig,
    key_prefix: String,
    /// "tenant:user" -> freshest local record
    local: DashMap<String, PresenceRecord>,
}

impl PresenceTracker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn CoordinationStore>,
        fanout: Arc<FanoutEngine>,
        config: PresenceConfig,
        coordination: &CoordinationConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                store,
                fanout,
                config,
                key_prefix: coordination.presence_prefix(),
                local: DashMap::new(),
            }),
        }
    }

    fn local_key(tenant_id: &str, user_id: &str) -> String {
        format!("{tenant_id}:{user_id}")
    }

    fn store_key(&self, tenant_id: &str, user_id: &str) -> String {
        format!("{}:{}:{}", self.inner.key_prefix, tenant_id, user_id)
    }

    /// Set a user's presence, mirror it, and announce the change to the
    /// tenant.
    #[tracing::instrument(name = "presence.set", skip(self))]
    pub async fn set_presence(&self, user_id: &str, tenant_id: &str, status: PresenceStatus) {
        let channels = self.current_channels(tenant_id, user_id).await;
        let local_key = Self::local_key(tenant_id, user_id);

        // last_seen never goes backwards for a (tenant, user) pair
        let last_seen = self
            .inner
            .local
            .get(&local_key)
            .map(|r| r.last_seen.max(Utc::now()))
            .unwrap_or_else(Utc::now);

        let record = PresenceRecord {
            user_id: user_id.to_string(),
            tenant_id: tenant_id.to_string(),
            status,
            last_seen,
            channels,
        };

        self.inner.local.insert(local_key, record.clone());
        PresenceMetrics::record_update(status.as_str());

        match serde_json::to_string(&record) {
            Ok(json) => {
                if let Err(e) = self
                    .inner
                    .store
                    .set_with_ttl(
                        &self.store_key(tenant_id, user_id),
                        json,
                        self.inner.config.ttl(),
                    )
                    .await
                {
                    tracing::warn!(
                        tenant_id = %tenant_id,
                        user_id = %user_id,
                        error = %e,
                        "Failed to mirror presence record"
                    );
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize presence record");
            }
        }

        let envelope = Envelope::presence_update(&record).shared();
        self.inner.fanout.broadcast_to_tenant(tenant_id, envelope).await;

        tracing::debug!(
            tenant_id = %tenant_id,
            user_id = %user_id,
            status = status.as_str(),
            "Presence updated"
        );
    }

    /// Current presence; the local map wins, the store is the fallback,
    /// absence means offline.
    pub async fn get_presence(&self, user_id: &str, tenant_id: &str) -> Option<PresenceRecord> {
        if let Some(record) = self.inner.local.get(&Self::local_key(tenant_id, user_id)) {
            return Some(record.clone());
        }

        match self.inner.store.get(&self.store_key(tenant_id, user_id)).await {
            Ok(Some(json)) => serde_json::from_str(&json).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Presence store read failed");
                None
            }
        }
    }

    /// All users of a tenant currently online anywhere in the fleet.
    pub async fn list_online_users(&self, tenant_id: &str) -> Vec<PresenceRecord> {
        let prefix = format!("{}:{}:", self.inner.key_prefix, tenant_id);

        let keys = match self.inner.store.scan_prefix(&prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "Presence scan failed, using local records only");
                return self
                    .inner
                    .local
                    .iter()
                    .filter(|r| r.tenant_id == tenant_id && r.status.is_online())
                    .map(|r| r.clone())
                    .collect();
            }
        };

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            match self.inner.store.get(&key).await {
                Ok(Some(json)) => {
                    if let Ok(record) = serde_json::from_str::<PresenceRecord>(&json) {
                        if record.status.is_online() {
                            records.push(record);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Presence store read failed");
                }
            }
        }
        records
    }

    /// Online users across all tenants (operational stats).
    pub async fn online_user_count(&self) -> usize {
        let prefix = format!("{}:", self.inner.key_prefix);
        match self.inner.store.scan_prefix(&prefix).await {
            Ok(keys) => {
                let mut online = 0;
                for key in keys {
                    if let Ok(Some(json)) = self.inner.store.get(&key).await {
                        if let Ok(record) = serde_json::from_str::<PresenceRecord>(&json) {
                            if record.status.is_online() {
                                online += 1;
                            }
                        }
                    }
                }
                online
            }
            Err(_) => self
                .inner
                .local
                .iter()
                .filter(|r| r.status.is_online())
                .count(),
        }
    }

    /// Union of channel subscriptions across the user's local connections.
    async fn current_channels(&self, tenant_id: &str, user_id: &str) -> Vec<ChannelName> {
        let mut channels = std::collections::HashSet::new();
        for conn in self.inner.registry.connections_for_user(tenant_id, user_id) {
            for channel in conn.subscriptions.read().await.iter() {
                channels.insert(channel.clone());
            }
        }
        channels.into_iter().collect()
    }

    fn has_connections(&self, tenant_id: &str, user_id: &str) -> bool {
        !self
            .inner
            .registry
            .connections_for_user(tenant_id, user_id)
            .is_empty()
    }

    /// Mark offline unless the user reconnected in the meantime.
    async fn mark_offline_if_idle(&self, tenant_id: &str, user_id: &str) {
        if self.has_connections(tenant_id, user_id) {
            return;
        }
        self.set_presence(user_id, tenant_id, PresenceStatus::Offline)
            .await;
    }

    /// Re-assert the TTL on mirrored records of users still connected here,
    /// so long-lived quiet connections do not read as offline elsewhere.
    pub async fn refresh_mirrors(&self) -> usize {
        let live: Vec<(String, String)> = self
            .inner
            .local
            .iter()
            .filter(|r| r.status.is_online())
            .map(|r| (r.tenant_id.clone(), r.user_id.clone()))
            .filter(|(tenant, user)| self.has_connections(tenant, user))
            .collect();

        let mut refreshed = 0;
        for (tenant, user) in live {
            let key = self.store_key(&tenant, &user);
            match self.inner.store.expire(&key, self.inner.config.ttl()).await {
                Ok(()) => refreshed += 1,
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "Failed to refresh presence mirror");
                }
            }
        }
        refreshed
    }

    /// Re-apply the connected status without changing it; refreshes the
    /// channel list and the mirror TTL after subscription changes.
    async fn refresh(&self, tenant_id: &str, user_id: &str) {
        let status = self
            .inner
            .local
            .get(&Self::local_key(tenant_id, user_id))
            .map(|r| r.status)
            .unwrap_or(PresenceStatus::Online);
        self.set_presence(user_id, tenant_id, status).await;
    }
}

#[async_trait]
impl EventListener for PresenceTracker {
    async fn on_event(&self, event: &RealtimeEvent) {
        match event {
            RealtimeEvent::ClientConnected { connection } => {
                self.set_presence(
                    &connection.subject_id,
                    &connection.tenant_id,
                    PresenceStatus::Online,
                )
                .await;
            }
            RealtimeEvent::ClientDisconnected { connection } => {
                let tenant_id = connection.tenant_id.clone();
                let user_id = connection.subject_id.clone();

                if self.has_connections(&tenant_id, &user_id) {
                    // Another device is still connected
                    self.refresh(&tenant_id, &user_id).await;
                    return;
                }

                let grace = self.inner.config.offline_grace();
                if grace.is_zero() {
                    self.set_presence(&user_id, &tenant_id, PresenceStatus::Offline)
                        .await;
                } else {
                    // Give quick reconnects a chance before flapping offline
                    let tracker = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        tracker.mark_offline_if_idle(&tenant_id, &user_id).await;
                    });
                }
            }
            RealtimeEvent::ChannelSubscribed { connection, .. }
            | RealtimeEvent::ChannelUnsubscribed { connection, .. } => {
                self.refresh(&connection.tenant_id, &connection.subject_id)
                    .await;
            }
        }
    }
}
