use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::server::{api_key_auth, AppState};
use crate::transport::{sse_handler, subscription_handler, ws_handler};

use super::health::{health, stats};
use super::metrics::prometheus_metrics;
use super::publish::{publish_channel, publish_tenant, publish_user};

pub fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        // Transports
        .route("/ws", get(ws_handler))
        .route("/events", get(sse_handler))
        .route("/events/subscriptions", post(subscription_handler))
        // Health & Stats
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        // Publish ingress for upstream services
        .nest(
            "/api/v1",
            Router::new()
                .route("/publish/channel", post(publish_channel))
                .route("/publish/tenant", post(publish_tenant))
                .route("/publish/user", post(publish_user))
                .layer(middleware::from_fn_with_state(state, api_key_auth)),
        )
}
