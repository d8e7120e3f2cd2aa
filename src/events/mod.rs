//! Lifecycle event bus.
//!
//! The registry and the fan-out engine announce connection and subscription
//! changes here; the presence tracker and the fan-out engine react to them.
//! Listeners are registered explicitly at startup, so the dependency graph
//! (Registry -> events -> {Presence, Fan-out}) stays visible in the wiring
//! code instead of hiding behind ad-hoc callbacks.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::channel::ChannelName;
use crate::registry::ConnectionHandle;

/// Lifecycle events observed by interested components.
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    ClientConnected {
        connection: Arc<ConnectionHandle>,
    },
    ClientDisconnected {
        connection: Arc<ConnectionHandle>,
    },
    ChannelSubscribed {
        connection: Arc<ConnectionHandle>,
        channel: ChannelName,
    },
    ChannelUnsubscribed {
        connection: Arc<ConnectionHandle>,
        channel: ChannelName,
    },
}

#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &RealtimeEvent);
}

/// Dispatches events to registered listeners in registration order.
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, listener: Arc<dyn EventListener>) {
        self.listeners
            .write()
            .expect("event bus lock poisoned")
            .push(listener);
    }

    pub async fn emit(&self, event: RealtimeEvent) {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .expect("event bus lock poisoned")
            .clone();

        for listener in listeners {
            listener.on_event(&event).await;
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl EventListener for CountingListener {
        async fn on_event(&self, _event: &RealtimeEvent) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_events_reach_all_listeners() {
        use crate::infrastructure::auth::AuthContext;
        use crate::registry::{ConnectionMetadata, TransportKind};
        use tokio::sync::mpsc;

        let bus = EventBus::new();
        let first = Arc::new(CountingListener {
            seen: AtomicUsize::new(0),
        });
        let second = Arc::new(CountingListener {
            seen: AtomicUsize::new(0),
        });
        bus.register(first.clone());
        bus.register(second.clone());

        let (tx, _rx) = mpsc::channel(1);
        let identity = AuthContext {
            subject_id: "u1".to_string(),
            tenant_id: "t1".to_string(),
            session_id: "s1".to_string(),
            roles: vec![],
        };
        let connection = Arc::new(ConnectionHandle::new(
            &identity,
            TransportKind::WebSocket,
            ConnectionMetadata::default(),
            tx,
        ));

        bus.emit(RealtimeEvent::ClientConnected { connection }).await;

        assert_eq!(first.seen.load(Ordering::SeqCst), 1);
        assert_eq!(second.seen.load(Ordering::SeqCst), 1);
    }
}
