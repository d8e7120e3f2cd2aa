use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::broadcast;

use crate::config::LivenessConfig;
use crate::metrics::LivenessMetrics;
use crate::protocol::{Envelope, CLOSE_LIVENESS_TIMEOUT};
use crate::registry::{ConnectionHandle, ConnectionRegistry, TransportKind};

/// Dead connections are closed after this multiple of the idle threshold
/// without any client-initiated activity.
const DEAD_AFTER_MULTIPLIER: i64 = 3;

/// Per-connection liveness state, derived from activity timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    /// Recent client-initiated activity.
    Active,
    /// Past the idle threshold, no probe outstanding yet.
    Idle,
    /// A ping was sent; waiting for any inbound frame. WebSocket only,
    /// since the unidirectional transport has no response channel.
    AwaitingPong,
    /// Past the grace window; the connection gets torn down.
    Dead,
}

/// Counters from one sweep pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepOutcome {
    pub pings_sent: usize,
    pub heartbeats_sent: usize,
    pub dead: usize,
}

/// Periodic task that probes idle connections, tears down dead ones, and
/// re-asserts TTLs on this instance's mirrored state.
pub struct LivenessMonitor {
    config: LivenessConfig,
    registry: Arc<ConnectionRegistry>,
    fanout: Option<Arc<crate::fanout::FanoutEngine>>,
    presence: Option<crate::presence::PresenceTracker>,
}

impl LivenessMonitor {
    pub fn new(config: LivenessConfig, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            config,
            registry,
            fanout: None,
            presence: None,
        }
    }

    /// Also refresh coordination-store mirrors on the refresh interval.
    pub fn with_mirrors(
        mut self,
        fanout: Arc<crate::fanout::FanoutEngine>,
        presence: crate::presence::PresenceTracker,
    ) -> Self {
        self.fanout = Some(fanout);
        self.presence = Some(presence);
        self
    }

    fn idle_threshold(&self, transport: TransportKind) -> ChronoDuration {
        let secs = match transport {
            TransportKind::WebSocket => self.config.ws_idle_secs,
            TransportKind::Sse => self.config.sse_idle_secs,
        };
        ChronoDuration::seconds(secs as i64)
    }

    /// Derive a connection's liveness state at a given instant.
    pub fn evaluate(&self, conn: &ConnectionHandle, now: DateTime<Utc>) -> LivenessState {
        let threshold = self.idle_threshold(conn.transport);
        let idle_for = now.signed_duration_since(conn.last_activity());

        if idle_for >= threshold * (DEAD_AFTER_MULTIPLIER as i32) {
            return LivenessState::Dead;
        }
        if idle_for < threshold {
            return LivenessState::Active;
        }
        match conn.transport {
            TransportKind::WebSocket if conn.probe_sent_at().is_some() => {
                LivenessState::AwaitingPong
            }
            _ => LivenessState::Idle,
        }
    }

    /// One sweep over all local connections.
    ///
    /// Takes the clock as a parameter so tests can advance time without
    /// traffic.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        for conn in self.registry.all() {
            match self.evaluate(&conn, now) {
                LivenessState::Active => {}
                LivenessState::AwaitingPong => {
                    // Still inside the grace window
                }
                LivenessState::Idle => {
                    self.probe(&conn, now, &mut outcome);
                }
                LivenessState::Dead => {
                    tracing::info!(
                        connection_id = %conn.id,
                        subject_id = %conn.subject_id,
                        transport = conn.transport.as_str(),
                        idle_secs = now.signed_duration_since(conn.last_activity()).num_seconds(),
                        "Connection dead, disconnecting"
                    );
                    conn.request_close(CLOSE_LIVENESS_TIMEOUT, "liveness timeout");
                    self.registry.remove(conn.id).await;
                    LivenessMetrics::record_dead();
                    outcome.dead += 1;
                }
            }
        }

        if outcome.dead > 0 || outcome.pings_sent > 0 || outcome.heartbeats_sent > 0 {
            tracing::debug!(
                pings = outcome.pings_sent,
                heartbeats = outcome.heartbeats_sent,
                dead = outcome.dead,
                "Liveness sweep completed"
            );
        }

        outcome
    }

    /// Send the transport-appropriate probe to an idle connection.
    fn probe(&self, conn: &Arc<ConnectionHandle>, now: DateTime<Utc>, outcome: &mut SweepOutcome) {
        match conn.transport {
            TransportKind::WebSocket => {
                if conn.enqueue(Envelope::ping().shared()).is_ok() {
                    conn.mark_probe_sent(now);
                    outcome.pings_sent += 1;
                }
            }
            TransportKind::Sse => {
                // No response channel; push heartbeats at most once per
                // threshold and rely on the absolute timeout for death
                let threshold = self.idle_threshold(conn.transport);
                let resend_due = conn
                    .probe_sent_at()
                    .map(|at| now.signed_duration_since(at) >= threshold)
                    .unwrap_or(true);
                if resend_due && conn.enqueue(Envelope::heartbeat().shared()).is_ok() {
                    conn.mark_probe_sent(now);
                    outcome.heartbeats_sent += 1;
                }
            }
        }
    }

    /// Re-assert TTLs on mirrored channel membership and presence records.
    async fn refresh_mirrors(&self) {
        let mut refreshed = 0;
        if let Some(fanout) = &self.fanout {
            refreshed += fanout.refresh_membership_mirrors().await;
        }
        if let Some(presence) = &self.presence {
            refreshed += presence.refresh_mirrors().await;
        }
        if refreshed > 0 {
            tracing::debug!(refreshed = refreshed, "Refreshed coordination mirrors");
        }
    }

    /// Run the monitor until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut sweep_timer = tokio::time::interval(self.config.sweep_interval());
        let mut refresh_timer = tokio::time::interval(self.config.mirror_refresh());
        // Skip immediate first ticks
        sweep_timer.tick().await;
        refresh_timer.tick().await;

        tracing::info!(
            ws_idle_secs = self.config.ws_idle_secs,
            sse_idle_secs = self.config.sse_idle_secs,
            sweep_interval_secs = self.config.sweep_interval_secs,
            "Liveness monitor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Liveness monitor received shutdown signal");
                    break;
                }
                _ = sweep_timer.tick() => {
                    self.sweep(Utc::now()).await;
                }
                _ = refresh_timer.tick() => {
                    self.refresh_mirrors().await;
                }
            }
        }

        tracing::info!("Liveness monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::infrastructure::auth::AuthContext;
    use crate::registry::{ConnectionLimits, ConnectionMetadata};
    use tokio::sync::mpsc;

    fn test_setup() -> (LivenessMonitor, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new(
            ConnectionLimits::default(),
            Arc::new(EventBus::new()),
        ));
        let monitor = LivenessMonitor::new(LivenessConfig::default(), registry.clone());
        (monitor, registry)
    }

    async fn connect(
        registry: &ConnectionRegistry,
        transport: TransportKind,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<Arc<Envelope>>) {
        let (tx, rx) = mpsc::channel(8);
        let identity = AuthContext {
            subject_id: "u1".to_string(),
            tenant_id: "t1".to_string(),
            session_id: "s1".to_string(),
            roles: vec![],
        };
        let handle = Arc::new(ConnectionHandle::new(
            &identity,
            transport,
            ConnectionMetadata::default(),
            tx,
        ));
        registry.register(handle.clone()).await.unwrap();
        (handle, rx)
    }

    #[tokio::test]
    async fn test_fresh_connection_is_active() {
        let (monitor, registry) = test_setup();
        let (conn, _rx) = connect(&registry, TransportKind::WebSocket).await;

        assert_eq!(monitor.evaluate(&conn, Utc::now()), LivenessState::Active);
    }

    #[tokio::test]
    async fn test_idle_then_awaiting_pong_then_active_on_frame() {
        let (monitor, registry) = test_setup();
        let (conn, mut rx) = connect(&registry, TransportKind::WebSocket).await;

        let later = Utc::now() + ChronoDuration::seconds(35);
        assert_eq!(monitor.evaluate(&conn, later), LivenessState::Idle);

        let outcome = monitor.sweep(later).await;
        assert_eq!(outcome.pings_sent, 1);
        let probe = rx.try_recv().unwrap();
        assert_eq!(probe.kind, crate::protocol::EnvelopeKind::Ping);

        assert_eq!(monitor.evaluate(&conn, later), LivenessState::AwaitingPong);

        // Any inbound frame returns the connection to Active
        conn.touch();
        assert_eq!(monitor.evaluate(&conn, Utc::now()), LivenessState::Active);
    }

    #[tokio::test]
    async fn test_silent_connection_dies_and_is_removed() {
        let (monitor, registry) = test_setup();
        let (conn, _rx) = connect(&registry, TransportKind::WebSocket).await;
        let id = conn.id;

        // Past 3x the 30s idle threshold with zero traffic
        let later = Utc::now() + ChronoDuration::seconds(95);
        assert_eq!(monitor.evaluate(&conn, later), LivenessState::Dead);

        let outcome = monitor.sweep(later).await;
        assert_eq!(outcome.dead, 1);
        assert!(!registry.contains(id));

        let close = conn.close_signal().borrow().clone();
        assert_eq!(close.unwrap().code, CLOSE_LIVENESS_TIMEOUT);
    }

    #[tokio::test]
    async fn test_sse_gets_heartbeats_not_pings() {
        let (monitor, registry) = test_setup();
        let (conn, mut rx) = connect(&registry, TransportKind::Sse).await;

        // SSE idles later than WebSocket
        let ws_idle = Utc::now() + ChronoDuration::seconds(35);
        assert_eq!(monitor.evaluate(&conn, ws_idle), LivenessState::Active);

        let sse_idle = Utc::now() + ChronoDuration::seconds(65);
        let outcome = monitor.sweep(sse_idle).await;
        assert_eq!(outcome.heartbeats_sent, 1);
        let probe = rx.try_recv().unwrap();
        assert_eq!(probe.kind, crate::protocol::EnvelopeKind::Heartbeat);

        // Sweeping again immediately does not re-send
        let outcome = monitor.sweep(sse_idle).await;
        assert_eq!(outcome.heartbeats_sent, 0);

        // The next threshold re-sends the heartbeat
        let next = sse_idle + ChronoDuration::seconds(61);
        let outcome = monitor.sweep(next).await;
        assert_eq!(outcome.heartbeats_sent, 1);
    }

    #[tokio::test]
    async fn test_sse_dies_only_after_absolute_timeout() {
        let (monitor, registry) = test_setup();
        let (conn, _rx) = connect(&registry, TransportKind::Sse).await;

        let before_timeout = Utc::now() + ChronoDuration::seconds(170);
        assert_ne!(monitor.evaluate(&conn, before_timeout), LivenessState::Dead);

        let past_timeout = Utc::now() + ChronoDuration::seconds(185);
        assert_eq!(monitor.evaluate(&conn, past_timeout), LivenessState::Dead);
    }
}
