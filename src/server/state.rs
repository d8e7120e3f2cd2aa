use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;

use crate::config::Settings;
use crate::coordination::{CoordinationStore, InMemoryCoordinationStore, RedisCoordinationStore};
use crate::events::EventBus;
use crate::fanout::FanoutEngine;
use crate::infrastructure::auth::{IdentityVerifier, JwtVerifier};
use crate::infrastructure::redis::{RedisHealth, RedisPool};
use crate::presence::PresenceTracker;
use crate::registry::{ConnectionLimits, ConnectionRegistry};

/// Explicitly constructed service graph owned by the process's startup
/// routine. Everything is dependency-injected, so tests can assemble two
/// "processes" sharing one coordination store inside one binary.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub identity: Arc<dyn IdentityVerifier>,
    pub store: Arc<dyn CoordinationStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub fanout: Arc<FanoutEngine>,
    pub presence: PresenceTracker,
    pub shutdown: broadcast::Sender<()>,
    pub start_time: Instant,
    pub coordination_backend: String,
    redis_health: Option<Arc<RedisHealth>>,
}

impl AppState {
    /// Production wiring: Redis-backed coordination plane and JWT identity
    /// verification.
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        let health = Arc::new(RedisHealth::new());
        let pool = Arc::new(RedisPool::new(settings.redis.clone(), health.clone())?);
        let store: Arc<dyn CoordinationStore> = Arc::new(RedisCoordinationStore::new(pool));
        let identity: Arc<dyn IdentityVerifier> = Arc::new(JwtVerifier::new(&settings.auth));

        Ok(Self::assemble(
            settings,
            store,
            identity,
            "redis",
            Some(health),
        ))
    }

    /// Single-process wiring without Redis; also the seam tests use to
    /// simulate multiple instances over one shared in-memory store.
    pub fn with_components(
        settings: Settings,
        store: Arc<dyn CoordinationStore>,
        identity: Arc<dyn IdentityVerifier>,
    ) -> Self {
        Self::assemble(settings, store, identity, "memory", None)
    }

    /// Convenience for local development without a Redis instance.
    pub fn standalone(settings: Settings) -> Self {
        let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
        let identity: Arc<dyn IdentityVerifier> = Arc::new(JwtVerifier::new(&settings.auth));
        Self::assemble(settings, store, identity, "memory", None)
    }

    fn assemble(
        settings: Settings,
        store: Arc<dyn CoordinationStore>,
        identity: Arc<dyn IdentityVerifier>,
        backend: &str,
        redis_health: Option<Arc<RedisHealth>>,
    ) -> Self {
        let settings = Arc::new(settings);
        let events = Arc::new(EventBus::new());

        let registry = Arc::new(ConnectionRegistry::new(
            ConnectionLimits {
                max_connections: settings.realtime.max_connections,
                max_connections_per_user: settings.realtime.max_connections_per_user,
            },
            events.clone(),
        ));

        let fanout = Arc::new(FanoutEngine::new(
            settings.coordination.clone(),
            registry.clone(),
            store.clone(),
            events.clone(),
        ));

        let presence = PresenceTracker::new(
            registry.clone(),
            store.clone(),
            fanout.clone(),
            settings.presence.clone(),
            &settings.coordination,
        );

        // Listener order matters: the fan-out engine purges channel state
        // before presence recomputes the user's remaining subscriptions
        events.register(fanout.clone());
        events.register(Arc::new(presence.clone()));

        let (shutdown, _) = broadcast::channel(4);

        Self {
            settings,
            identity,
            store,
            registry,
            fanout,
            presence,
            shutdown,
            start_time: Instant::now(),
            coordination_backend: backend.to_string(),
            redis_health,
        }
    }

    pub fn coordination_healthy(&self) -> bool {
        self.redis_health
            .as_ref()
            .map(|h| h.is_healthy())
            .unwrap_or(true)
    }
}
