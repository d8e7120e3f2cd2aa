//! Health check and statistics endpoints.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub server_id: String,
    pub coordination: CoordinationHealthResponse,
    pub connections: ConnectionHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct CoordinationHealthResponse {
    pub backend: String,
    pub healthy: bool,
}

#[derive(Debug, Serialize)]
pub struct ConnectionHealthResponse {
    pub total: usize,
    pub unique_users: usize,
    pub active_channels: usize,
}

/// Operational stats surface.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub connected_clients: usize,
    pub active_channels: usize,
    pub online_users: usize,
    pub clients_by_tenant: std::collections::HashMap<String, usize>,
    pub fanout: crate::fanout::FanoutStatsSnapshot,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry_stats = state.registry.stats();
    let coordination_healthy = state.coordination_healthy();

    let status = if coordination_healthy {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        server_id: state.settings.coordination.server_id.clone(),
        coordination: CoordinationHealthResponse {
            backend: state.coordination_backend.clone(),
            healthy: coordination_healthy,
        },
        connections: ConnectionHealthResponse {
            total: registry_stats.connected_clients,
            unique_users: registry_stats.unique_users,
            active_channels: state.fanout.active_channels(),
        },
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let registry_stats = state.registry.stats();

    Json(StatsResponse {
        connected_clients: registry_stats.connected_clients,
        active_channels: state.fanout.active_channels(),
        online_users: state.presence.online_user_count().await,
        clients_by_tenant: registry_stats.clients_by_tenant,
        fanout: state.fanout.stats(),
    })
}
