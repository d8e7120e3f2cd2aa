//! Prometheus metrics endpoint.

use axum::{extract::State, http::StatusCode, response::IntoResponse};

use crate::metrics;
use crate::server::AppState;

/// GET /metrics - Prometheus metrics endpoint
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    update_gauges_from_state(&state).await;

    match metrics::encode_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            output,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(axum::http::header::CONTENT_TYPE, "text/plain")],
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

/// Refresh gauges from live state
async fn update_gauges_from_state(state: &AppState) {
    let registry_stats = state.registry.stats();
    metrics::CONNECTIONS_ACTIVE.set(registry_stats.connected_clients as i64);
    metrics::CHANNELS_ACTIVE.set(state.fanout.active_channels() as i64);
    metrics::PRESENCE_ONLINE_USERS.set(state.presence.online_user_count().await as i64);

    metrics::CONNECTIONS_BY_TENANT.reset();
    for (tenant, count) in &registry_stats.clients_by_tenant {
        metrics::CONNECTIONS_BY_TENANT
            .with_label_values(&[tenant])
            .set(*count as i64);
    }
}
