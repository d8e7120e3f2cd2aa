//! Cross-instance fan-out tests.
//!
//! Two simulated server instances run inside one test binary, sharing a
//! single in-memory coordination store the way production instances share
//! Redis.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use vantage_realtime_service::auth::{AuthContext, AuthError, IdentityVerifier};
use vantage_realtime_service::channel::ChannelName;
use vantage_realtime_service::config::{
    ApiConfig, AuthConfig, CoordinationConfig, LivenessConfig, PresenceConfig, RealtimeConfig,
    RedisConfig, ServerConfig, Settings,
};
use vantage_realtime_service::coordination::{
    CoordinationStore, InMemoryCoordinationStore, PeerSubscriber,
};
use vantage_realtime_service::protocol::{Envelope, EnvelopeKind, EventData};
use vantage_realtime_service::registry::{ConnectionHandle, ConnectionMetadata, TransportKind};
use vantage_realtime_service::server::AppState;

struct StaticVerifier;

#[async_trait]
impl IdentityVerifier for StaticVerifier {
    async fn verify(&self, _token: &str) -> Result<AuthContext, AuthError> {
        Ok(AuthContext {
            subject_id: "static".to_string(),
            tenant_id: "t1".to_string(),
            session_id: "s1".to_string(),
            roles: vec![],
        })
    }
}

fn test_settings(server_id: &str) -> Settings {
    Settings {
        server: ServerConfig::default(),
        auth: AuthConfig {
            jwt_secret: "test-secret".to_string(),
            issuer: None,
            audience: None,
        },
        redis: RedisConfig::default(),
        api: ApiConfig { key: None },
        realtime: RealtimeConfig::default(),
        liveness: LivenessConfig::default(),
        presence: PresenceConfig::default(),
        coordination: CoordinationConfig {
            server_id: server_id.to_string(),
            key_prefix: "vantage-test".to_string(),
            mirror_ttl_secs: 300,
        },
    }
}

/// Build one simulated instance and start its peer subscriber.
fn build_instance(server_id: &str, store: Arc<dyn CoordinationStore>) -> AppState {
    let state = AppState::with_components(
        test_settings(server_id),
        store.clone(),
        Arc::new(StaticVerifier),
    );

    let subscriber = PeerSubscriber::new(
        state.settings.coordination.clone(),
        store,
        state.fanout.clone(),
        state.shutdown.subscribe(),
    );
    tokio::spawn(async move {
        subscriber.run().await;
    });

    state
}

async fn connect(
    state: &AppState,
    subject: &str,
    tenant: &str,
) -> (Arc<ConnectionHandle>, mpsc::Receiver<Arc<Envelope>>) {
    let (tx, rx) = mpsc::channel(64);
    let identity = AuthContext {
        subject_id: subject.to_string(),
        tenant_id: tenant.to_string(),
        session_id: "session".to_string(),
        roles: vec![],
    };
    let handle = Arc::new(ConnectionHandle::new(
        &identity,
        TransportKind::WebSocket,
        ConnectionMetadata::default(),
        tx,
    ));
    state.registry.register(handle.clone()).await.unwrap();
    (handle, rx)
}

/// Wait for the next opaque notification envelope, skipping presence and
/// confirmation traffic.
async fn next_notification(rx: &mut mpsc::Receiver<Arc<Envelope>>) -> Option<Arc<Envelope>> {
    let deadline = Duration::from_secs(2);
    loop {
        let envelope = timeout(deadline, rx.recv()).await.ok()??;
        if envelope.kind == EnvelopeKind::Notification {
            if let Some(EventData::Notification { .. }) = envelope.data {
                return Some(envelope);
            }
        }
    }
}

fn payload_of(envelope: &Envelope) -> serde_json::Value {
    match &envelope.data {
        Some(EventData::Notification { payload }) => payload.clone(),
        other => panic!("expected notification payload, got {other:?}"),
    }
}

#[tokio::test]
async fn test_publish_on_a_reaches_subscriber_on_b_exactly_once() {
    let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
    let a = build_instance("server-a", store.clone());
    let b = build_instance("server-b", store.clone());

    // Let the peer subscribers attach to the topics
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (conn_b, mut rx_b) = connect(&b, "u1", "t1").await;
    let outcome = b.fanout.subscribe(conn_b.id, "metrics").await.unwrap();
    assert_eq!(outcome.channel.as_str(), "t1:metrics");

    // Publish on A, which has no local subscribers
    let channel = ChannelName::parse("t1:metrics").unwrap();
    let envelope = Envelope::notification(channel.clone(), serde_json::json!({"value": 42}));
    let local_delivered = a.fanout.publish(&channel, envelope.shared()).await;
    assert_eq!(local_delivered, 0);

    // B's subscriber receives exactly one copy
    let received = next_notification(&mut rx_b).await.expect("no envelope");
    assert_eq!(payload_of(&received)["value"], 42);
    assert_eq!(received.channel.as_ref().unwrap().as_str(), "t1:metrics");

    let duplicate = timeout(Duration::from_millis(200), async {
        next_notification(&mut rx_b).await
    })
    .await;
    assert!(duplicate.is_err(), "subscriber received a duplicate envelope");
}

#[tokio::test]
async fn test_origin_suppression_no_double_delivery() {
    let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
    let a = build_instance("server-a", store.clone());
    let b = build_instance("server-b", store.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;

    let (conn_a, mut rx_a) = connect(&a, "ua", "t1").await;
    let (conn_b, mut rx_b) = connect(&b, "ub", "t1").await;
    a.fanout.subscribe(conn_a.id, "alerts").await.unwrap();
    b.fanout.subscribe(conn_b.id, "alerts").await.unwrap();

    let channel = ChannelName::parse("t1:alerts").unwrap();
    let envelope = Envelope::notification(channel.clone(), serde_json::json!({"seq": 1}));

    // A delivers locally and publishes the peer event; A must not redeliver
    // its own event when it comes back around the topic
    let local = a.fanout.publish(&channel, envelope.shared()).await;
    assert_eq!(local, 1);

    let on_a = next_notification(&mut rx_a).await.expect("A missed delivery");
    assert_eq!(payload_of(&on_a)["seq"], 1);
    let on_b = next_notification(&mut rx_b).await.expect("B missed delivery");
    assert_eq!(payload_of(&on_b)["seq"], 1);

    let dup_a = timeout(Duration::from_millis(200), async {
        next_notification(&mut rx_a).await
    })
    .await;
    assert!(dup_a.is_err(), "origin instance saw its own peer event");
}

#[tokio::test]
async fn test_tenant_broadcast_crosses_instances_and_respects_tenancy() {
    let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
    let a = build_instance("server-a", store.clone());
    let b = build_instance("server-b", store.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;

    let (_conn_b1, mut rx_b1) = connect(&b, "u1", "t1").await;
    let (_conn_b2, mut rx_b2) = connect(&b, "u2", "t2").await;

    let channel = ChannelName::parse("t1:broadcast").unwrap();
    let envelope = Envelope::notification(channel, serde_json::json!({"announce": true}));
    a.fanout.broadcast_to_tenant("t1", envelope.shared()).await;

    let received = next_notification(&mut rx_b1).await.expect("t1 user missed");
    assert_eq!(payload_of(&received)["announce"], true);

    // The t2 connection sees nothing from the t1 broadcast
    let other_tenant = timeout(Duration::from_millis(200), async {
        next_notification(&mut rx_b2).await
    })
    .await;
    assert!(other_tenant.is_err(), "tenant isolation breached");
}

#[tokio::test]
async fn test_user_send_reaches_all_devices_across_instances() {
    let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
    let a = build_instance("server-a", store.clone());
    let b = build_instance("server-b", store.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;

    // Same user connected on both instances
    let (_conn_a, mut rx_a) = connect(&a, "u1", "t1").await;
    let (_conn_b, mut rx_b) = connect(&b, "u1", "t1").await;

    let channel = ChannelName::parse("t1:direct").unwrap();
    let envelope = Envelope::notification(channel, serde_json::json!({"ping": "you"}));
    let local = a.fanout.send_to_user("t1", "u1", envelope.shared()).await;
    assert_eq!(local, 1);

    let on_a = next_notification(&mut rx_a).await.expect("local device missed");
    assert_eq!(payload_of(&on_a)["ping"], "you");
    let on_b = next_notification(&mut rx_b).await.expect("remote device missed");
    assert_eq!(payload_of(&on_b)["ping"], "you");
}

#[tokio::test]
async fn test_presence_is_visible_across_instances() {
    let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
    let a = build_instance("server-a", store.clone());
    let b = build_instance("server-b", store.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;

    let (conn_a, _rx_a) = connect(&a, "u1", "t1").await;

    // Instance B sees the user through the mirrored record
    let online = b.presence.list_online_users("t1").await;
    assert!(online.iter().any(|r| r.user_id == "u1"));

    a.registry.remove(conn_a.id).await;

    let online = b.presence.list_online_users("t1").await;
    assert!(!online.iter().any(|r| r.user_id == "u1"));
}
