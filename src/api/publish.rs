//! Server-side publish ingress.
//!
//! Upstream services (alert evaluators, metric pipelines) originate events
//! here; the handlers call the same fan-out operations the transports use,
//! so a publish on any instance reaches subscribers on every instance.

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::ChannelName;
use crate::error::Result;
use crate::protocol::Envelope;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct ChannelPublishRequest {
    /// Fully-qualified, tenant-prefixed channel name.
    pub channel: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct TenantPublishRequest {
    pub tenant_id: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct UserPublishRequest {
    pub tenant_id: String,
    pub user_id: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub envelope_id: Uuid,
    /// Connections reached on this instance; peer instances deliver to
    /// their own subscribers asynchronously.
    pub local_delivered: usize,
    pub timestamp: DateTime<Utc>,
}

/// Publish an envelope to a channel, fleet-wide
#[tracing::instrument(
    name = "api.publish_channel",
    skip(state, request),
    fields(channel = %request.channel)
)]
pub async fn publish_channel(
    State(state): State<AppState>,
    Json(request): Json<ChannelPublishRequest>,
) -> Result<Json<PublishResponse>> {
    let channel = ChannelName::parse(&request.channel)?;
    let envelope = Envelope::notification(channel.clone(), request.data).shared();
    let envelope_id = envelope.id;

    let local_delivered = state.fanout.publish(&channel, envelope).await;

    Ok(Json(PublishResponse {
        envelope_id,
        local_delivered,
        timestamp: Utc::now(),
    }))
}

/// Broadcast an envelope to every connection of a tenant, fleet-wide
#[tracing::instrument(
    name = "api.publish_tenant",
    skip(state, request),
    fields(tenant_id = %request.tenant_id)
)]
pub async fn publish_tenant(
    State(state): State<AppState>,
    Json(request): Json<TenantPublishRequest>,
) -> Result<Json<PublishResponse>> {
    let channel = ChannelName::qualify("broadcast", &request.tenant_id)?;
    let envelope = Envelope::notification(channel, request.data).shared();
    let envelope_id = envelope.id;

    let local_delivered = state
        .fanout
        .broadcast_to_tenant(&request.tenant_id, envelope)
        .await;

    Ok(Json(PublishResponse {
        envelope_id,
        local_delivered,
        timestamp: Utc::now(),
    }))
}

/// Send an envelope to one user's connections, fleet-wide
#[tracing::instrument(
    name = "api.publish_user",
    skip(state, request),
    fields(tenant_id = %request.tenant_id, user_id = %request.user_id)
)]
pub async fn publish_user(
    State(state): State<AppState>,
    Json(request): Json<UserPublishRequest>,
) -> Result<Json<PublishResponse>> {
    let channel = ChannelName::qualify("direct", &request.tenant_id)?;
    let envelope = Envelope::notification(channel, request.data).shared();
    let envelope_id = envelope.id;

    let local_delivered = state
        .fanout
        .send_to_user(&request.tenant_id, &request.user_id, envelope)
        .await;

    Ok(Json(PublishResponse {
        envelope_id,
        local_delivered,
        timestamp: Utc::now(),
    }))
}
