//! Connection handle and related types

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use uuid::Uuid;

use crate::channel::ChannelName;
use crate::infrastructure::auth::AuthContext;
use crate::protocol::Envelope;
use std::sync::Arc;

/// Which transport terminated this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    Sse,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::Sse => "sse",
        }
    }
}

/// Request metadata captured at handshake time.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetadata {
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

/// Handle for a single live connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: Uuid,
    pub subject_id: String,
    pub tenant_id: String,
    pub session_id: String,
    pub roles: Vec<String>,
    pub transport: TransportKind,
    pub metadata: ConnectionMetadata,
    pub connected_at: DateTime<Utc>,
    /// Last client-initiated activity (Unix seconds), lock-free updates
    last_activity: AtomicI64,
    /// Last liveness probe sent (Unix seconds); 0 means none outstanding
    probe_sent_at: AtomicI64,
    pub subscriptions: RwLock<HashSet<ChannelName>>,
    sender: mpsc::Sender<Arc<Envelope>>,
    /// Forced-close signal; bypasses the outbound queue so a slow consumer
    /// can still be told to go away.
    close_tx: watch::Sender<Option<CloseRequest>>,
}

/// Structured close code and reason handed to the transport task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    pub code: u16,
    pub reason: String,
}

impl ConnectionHandle {
    pub fn new(
        identity: &AuthContext,
        transport: TransportKind,
        metadata: ConnectionMetadata,
        sender: mpsc::Sender<Arc<Envelope>>,
    ) -> Self {
        let now = Utc::now();
        let (close_tx, _) = watch::channel(None);
        Self {
            id: Uuid::new_v4(),
            subject_id: identity.subject_id.clone(),
            tenant_id: identity.tenant_id.clone(),
            session_id: identity.session_id.clone(),
            roles: identity.roles.clone(),
            transport,
            metadata,
            connected_at: now,
            last_activity: AtomicI64::new(now.timestamp()),
            probe_sent_at: AtomicI64::new(0),
            subscriptions: RwLock::new(HashSet::new()),
            sender,
            close_tx,
        }
    }

    /// Record client-initiated activity. Any inbound frame clears an
    /// outstanding liveness probe.
    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
        self.probe_sent_at.store(0, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_activity.load(Ordering::Relaxed), 0)
            .unwrap_or_else(Utc::now)
    }

    pub fn mark_probe_sent(&self, at: DateTime<Utc>) {
        self.probe_sent_at.store(at.timestamp(), Ordering::Relaxed);
    }

    pub fn probe_sent_at(&self) -> Option<DateTime<Utc>> {
        match self.probe_sent_at.load(Ordering::Relaxed) {
            0 => None,
            secs => DateTime::from_timestamp(secs, 0),
        }
    }

    /// Queue an envelope for delivery without blocking.
    ///
    /// A full queue is a slow consumer; per the backpressure policy the
    /// caller disconnects the connection instead of waiting.
    pub fn enqueue(&self, envelope: Arc<Envelope>) -> Result<(), OutboundError> {
        self.sender.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => OutboundError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => OutboundError::Closed,
        })
    }

    /// Ask the transport task to close the connection. Delivered out of band
    /// so it works even when the outbound queue is full.
    pub fn request_close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.close_tx.send(Some(CloseRequest {
            code,
            reason: reason.into(),
        }));
    }

    /// Watch for forced-close requests; used by the transport tasks.
    pub fn close_signal(&self) -> watch::Receiver<Option<CloseRequest>> {
        self.close_tx.subscribe()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}

/// Delivery failure for a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OutboundError {
    #[error("outbound queue full")]
    QueueFull,
    #[error("transport closed")]
    Closed,
}

/// Error returned when a connection cannot be registered.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// Generated connection id collided; ids are UUIDv4, so this indicates
    /// a fatal bug rather than a user-facing condition.
    #[error("duplicate connection id {0}")]
    DuplicateConnection(Uuid),

    #[error("Total connection limit exceeded ({current}/{max})")]
    TotalLimitExceeded { current: usize, max: usize },

    #[error("User {subject_id} connection limit exceeded ({current}/{max})")]
    UserLimitExceeded {
        subject_id: String,
        current: usize,
        max: usize,
    },
}

/// Limits for connection management
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_connections: usize,
    pub max_connections_per_user: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_connections: 10000,
            max_connections_per_user: 5,
        }
    }
}
