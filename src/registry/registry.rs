use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::events::{EventBus, RealtimeEvent};

use super::types::{ConnectionHandle, ConnectionLimits, RegistryError};

/// Authoritative local record of every live connection on this process.
///
/// Owned exclusively by the accepting process; only its effects
/// (subscriptions, presence) are shared through the coordination store.
pub struct ConnectionRegistry {
    /// connection_id -> ConnectionHandle
    connections: DashMap<Uuid, Arc<ConnectionHandle>>,
    /// (tenant_id, subject_id) -> Set<connection_id> (supports multiple devices)
    user_index: DashMap<(String, String), HashSet<Uuid>>,
    /// tenant_id -> Set<connection_id>
    tenant_index: DashMap<String, HashSet<Uuid>>,
    limits: ConnectionLimits,
    events: Arc<EventBus>,
}

impl ConnectionRegistry {
    pub fn new(limits: ConnectionLimits, events: Arc<EventBus>) -> Self {
        Self {
            connections: DashMap::new(),
            user_index: DashMap::new(),
            tenant_index: DashMap::new(),
            limits,
            events,
        }
    }

    /// Register a new connection and announce `client_connected`.
    pub async fn register(&self, handle: Arc<ConnectionHandle>) -> Result<(), RegistryError> {
        if self.connections.len() >= self.limits.max_connections {
            return Err(RegistryError::TotalLimitExceeded {
                current: self.connections.len(),
                max: self.limits.max_connections,
            });
        }

        let user_key = (handle.tenant_id.clone(), handle.subject_id.clone());
        let user_connections = self
            .user_index
            .get(&user_key)
            .map(|c| c.len())
            .unwrap_or(0);
        if user_connections >= self.limits.max_connections_per_user {
            return Err(RegistryError::UserLimitExceeded {
                subject_id: handle.subject_id.clone(),
                current: user_connections,
                max: self.limits.max_connections_per_user,
            });
        }

        let conn_id = handle.id;
        if self.connections.contains_key(&conn_id) {
            return Err(RegistryError::DuplicateConnection(conn_id));
        }

        self.connections.insert(conn_id, handle.clone());
        self.user_index.entry(user_key).or_default().insert(conn_id);
        self.tenant_index
            .entry(handle.tenant_id.clone())
            .or_default()
            .insert(conn_id);

        tracing::info!(
            connection_id = %conn_id,
            subject_id = %handle.subject_id,
            tenant_id = %handle.tenant_id,
            transport = handle.transport.as_str(),
            "Connection registered"
        );

        self.events
            .emit(RealtimeEvent::ClientConnected {
                connection: handle,
            })
            .await;

        Ok(())
    }

    /// Remove a connection and announce `client_disconnected`.
    ///
    /// Idempotent: removing an unknown id is a no-op returning `None`.
    pub async fn remove(&self, connection_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        let (_, handle) = self.connections.remove(&connection_id)?;

        let user_key = (handle.tenant_id.clone(), handle.subject_id.clone());
        if let Some(mut user_conns) = self.user_index.get_mut(&user_key) {
            user_conns.remove(&connection_id);
            if user_conns.is_empty() {
                drop(user_conns);
                self.user_index.remove(&user_key);
            }
        }
        if let Some(mut tenant_conns) = self.tenant_index.get_mut(&handle.tenant_id) {
            tenant_conns.remove(&connection_id);
            if tenant_conns.is_empty() {
                drop(tenant_conns);
                self.tenant_index.remove(&handle.tenant_id);
            }
        }

        tracing::info!(
            connection_id = %connection_id,
            subject_id = %handle.subject_id,
            tenant_id = %handle.tenant_id,
            "Connection removed"
        );

        self.events
            .emit(RealtimeEvent::ClientDisconnected {
                connection: handle.clone(),
            })
            .await;

        Some(handle)
    }

    /// Update `last_activity`; used on every inbound frame.
    pub fn touch(&self, connection_id: Uuid) -> bool {
        match self.connections.get(&connection_id) {
            Some(handle) => {
                handle.touch();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, connection_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&connection_id).map(|h| h.clone())
    }

    pub fn contains(&self, connection_id: Uuid) -> bool {
        self.connections.contains_key(&connection_id)
    }

    /// All connections of one user within one tenant.
    pub fn connections_for_user(
        &self,
        tenant_id: &str,
        subject_id: &str,
    ) -> Vec<Arc<ConnectionHandle>> {
        self.user_index
            .get(&(tenant_id.to_string(), subject_id.to_string()))
            .map(|conn_ids| {
                conn_ids
                    .iter()
                    .filter_map(|id| self.connections.get(id).map(|h| h.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All connections of one tenant.
    pub fn connections_for_tenant(&self, tenant_id: &str) -> Vec<Arc<ConnectionHandle>> {
        self.tenant_index
            .get(tenant_id)
            .map(|conn_ids| {
                conn_ids
                    .iter()
                    .filter_map(|id| self.connections.get(id).map(|h| h.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut clients_by_tenant = HashMap::new();
        for entry in self.tenant_index.iter() {
            clients_by_tenant.insert(entry.key().clone(), entry.value().len());
        }

        RegistryStats {
            connected_clients: self.connections.len(),
            unique_users: self.user_index.len(),
            clients_by_tenant,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryStats {
    pub connected_clients: usize,
    pub unique_users: usize,
    pub clients_by_tenant: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::auth::AuthContext;
    use crate::registry::{ConnectionMetadata, TransportKind};
    use tokio::sync::mpsc;

    fn test_identity(subject: &str, tenant: &str) -> AuthContext {
        AuthContext {
            subject_id: subject.to_string(),
            tenant_id: tenant.to_string(),
            session_id: "session".to_string(),
            roles: vec![],
        }
    }

    fn test_registry(limits: ConnectionLimits) -> ConnectionRegistry {
        ConnectionRegistry::new(limits, Arc::new(EventBus::new()))
    }

    fn test_handle(subject: &str, tenant: &str) -> Arc<ConnectionHandle> {
        let (tx, _rx) = mpsc::channel(8);
        Arc::new(ConnectionHandle::new(
            &test_identity(subject, tenant),
            TransportKind::WebSocket,
            ConnectionMetadata::default(),
            tx,
        ))
    }

    #[tokio::test]
    async fn test_register_and_remove() {
        let registry = test_registry(ConnectionLimits::default());
        let handle = test_handle("u1", "t1");
        let id = handle.id;

        registry.register(handle).await.unwrap();
        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);

        let removed = registry.remove(id).await;
        assert!(removed.is_some());
        assert!(!registry.contains(id));

        // Second removal is a no-op, not an error
        assert!(registry.remove(id).await.is_none());
    }

    #[tokio::test]
    async fn test_user_limit() {
        let registry = test_registry(ConnectionLimits {
            max_connections: 100,
            max_connections_per_user: 2,
        });

        registry.register(test_handle("u1", "t1")).await.unwrap();
        registry.register(test_handle("u1", "t1")).await.unwrap();

        let rejected = registry.register(test_handle("u1", "t1")).await;
        assert!(matches!(
            rejected,
            Err(RegistryError::UserLimitExceeded { .. })
        ));

        // A different user is unaffected
        registry.register(test_handle("u2", "t1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_total_limit() {
        let registry = test_registry(ConnectionLimits {
            max_connections: 1,
            max_connections_per_user: 5,
        });

        registry.register(test_handle("u1", "t1")).await.unwrap();
        let rejected = registry.register(test_handle("u2", "t1")).await;
        assert!(matches!(
            rejected,
            Err(RegistryError::TotalLimitExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_tenant_and_user_lookup() {
        let registry = test_registry(ConnectionLimits::default());
        registry.register(test_handle("u1", "t1")).await.unwrap();
        registry.register(test_handle("u1", "t1")).await.unwrap();
        registry.register(test_handle("u2", "t1")).await.unwrap();
        registry.register(test_handle("u3", "t2")).await.unwrap();

        assert_eq!(registry.connections_for_user("t1", "u1").len(), 2);
        assert_eq!(registry.connections_for_tenant("t1").len(), 3);
        assert_eq!(registry.connections_for_tenant("t2").len(), 1);
        assert!(registry.connections_for_tenant("t3").is_empty());

        let stats = registry.stats();
        assert_eq!(stats.connected_clients, 4);
        assert_eq!(stats.unique_users, 3);
        assert_eq!(stats.clients_by_tenant["t1"], 3);
        assert_eq!(stats.clients_by_tenant["t2"], 1);
    }

    #[tokio::test]
    async fn test_touch_unknown_connection() {
        let registry = test_registry(ConnectionLimits::default());
        assert!(!registry.touch(uuid::Uuid::new_v4()));
    }
}
