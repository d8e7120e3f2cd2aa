//! Graceful shutdown handling for the realtime service.
//!
//! Shutdown broadcasts a `reconnect` envelope (with a retry hint) to every
//! local connection so clients can move to another instance, signals the
//! background tasks to stop, and waits briefly for connections to drain.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::protocol::Envelope;
use crate::registry::ConnectionRegistry;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for connections to close after notification
    pub drain_timeout: Duration,
    /// Suggested reconnect delay sent to clients (milliseconds)
    pub reconnect_retry_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(10),
            reconnect_retry_ms: 5000,
        }
    }
}

/// Handles graceful shutdown of the realtime service
pub struct GracefulShutdown {
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(registry: Arc<ConnectionRegistry>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            registry,
            shutdown_tx,
            config: ShutdownConfig::default(),
        }
    }

    pub fn with_config(
        registry: Arc<ConnectionRegistry>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            registry,
            shutdown_tx,
            config,
        }
    }

    /// Execute the shutdown sequence.
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_connections = self.registry.len())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - notifying clients");
        result.clients_notified = self.notify_clients(reason);

        tracing::info!("Signaling background tasks to stop");
        let _ = self.shutdown_tx.send(());

        tracing::info!("Waiting for connections to close");
        result.connections_closed = self.wait_for_connections_to_close().await;

        result.duration = start.elapsed();
        result.success = true;

        tracing::info!(
            clients_notified = result.clients_notified,
            connections_closed = result.connections_closed,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }

    /// Queue the reconnect envelope on every local connection.
    fn notify_clients(&self, reason: &str) -> usize {
        let connections = self.registry.all();
        if connections.is_empty() {
            return 0;
        }

        let envelope = Envelope::reconnect(reason, self.config.reconnect_retry_ms).shared();
        let mut notified = 0;

        for conn in connections {
            if conn.enqueue(envelope.clone()).is_ok() {
                notified += 1;
            }
        }

        tracing::info!(notified = notified, "Reconnect envelopes queued");
        notified
    }

    /// Wait for connections to close gracefully
    async fn wait_for_connections_to_close(&self) -> usize {
        let initial = self.registry.len();
        if initial == 0 {
            return 0;
        }

        let registry = self.registry.clone();
        let wait_future = async {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if registry.is_empty() {
                    break;
                }
            }
        };

        let _ = timeout(self.config.drain_timeout, wait_future).await;

        let remaining = self.registry.len();
        if remaining > 0 {
            tracing::warn!(
                remaining_connections = remaining,
                "Some connections did not close gracefully"
            );
        }

        initial - remaining
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    pub success: bool,
    pub clients_notified: usize,
    pub connections_closed: usize,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::infrastructure::auth::AuthContext;
    use crate::protocol::EnvelopeKind;
    use crate::registry::{ConnectionHandle, ConnectionLimits, ConnectionMetadata, TransportKind};
    use tokio::sync::mpsc;

    fn test_registry() -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new(
            ConnectionLimits::default(),
            Arc::new(EventBus::new()),
        ))
    }

    #[tokio::test]
    async fn test_shutdown_no_connections() {
        let registry = test_registry();
        let (tx, _) = broadcast::channel(1);
        let shutdown = GracefulShutdown::new(registry, tx);

        let result = shutdown.execute("test shutdown").await;

        assert!(result.success);
        assert_eq!(result.clients_notified, 0);
        assert_eq!(result.connections_closed, 0);
    }

    #[tokio::test]
    async fn test_shutdown_notifies_with_reconnect_envelope() {
        let registry = test_registry();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let (conn_tx, mut conn_rx) = mpsc::channel(8);
        let identity = AuthContext {
            subject_id: "u1".to_string(),
            tenant_id: "t1".to_string(),
            session_id: "s1".to_string(),
            roles: vec![],
        };
        let handle = Arc::new(ConnectionHandle::new(
            &identity,
            TransportKind::WebSocket,
            ConnectionMetadata::default(),
            conn_tx,
        ));
        registry.register(handle.clone()).await.unwrap();

        let shutdown = GracefulShutdown::with_config(
            registry.clone(),
            shutdown_tx,
            ShutdownConfig {
                drain_timeout: Duration::from_millis(200),
                reconnect_retry_ms: 1234,
            },
        );

        let result = shutdown.execute("deploy").await;
        assert_eq!(result.clients_notified, 1);

        let envelope = conn_rx.try_recv().unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Reconnect);
        assert_eq!(envelope.retry, Some(1234));

        // Background tasks got the signal
        assert!(shutdown_rx.try_recv().is_ok());
    }

    #[test]
    fn test_shutdown_config_defaults() {
        let config = ShutdownConfig::default();
        assert_eq!(config.drain_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect_retry_ms, 5000);
    }
}
