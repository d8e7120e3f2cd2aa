//! WebSocket transport adapter.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::infrastructure::auth::{AuthContext, ROLE_PUBLISHER};
use crate::metrics::ConnectionMetrics;
use crate::protocol::{ClientEnvelope, Envelope};
use crate::registry::{ConnectionHandle, ConnectionMetadata, TransportKind};
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// WebSocket upgrade handler: `GET /ws?token=<bearer>`
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query, headers),
    fields(has_query_token = query.token.is_some())
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let token = match super::extract_token(query.token.as_deref(), &headers) {
        Some(t) => t,
        None => {
            return (StatusCode::UNAUTHORIZED, "Missing authentication token").into_response();
        }
    };

    // Handshake-time verification is bounded; a stuck verifier rejects the
    // connection instead of holding the upgrade open
    let verify = state.identity.verify(&token);
    let identity = match timeout(state.settings.realtime.handshake_timeout(), verify).await {
        Ok(Ok(identity)) => identity,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Token verification failed");
            return (StatusCode::UNAUTHORIZED, "Invalid token").into_response();
        }
        Err(_) => {
            tracing::warn!("Token verification timed out");
            return (StatusCode::UNAUTHORIZED, "Verification timeout").into_response();
        }
    };

    let metadata = ConnectionMetadata {
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        ip_address: Some(addr.ip().to_string()),
    };

    tracing::info!(
        subject_id = %identity.subject_id,
        tenant_id = %identity.tenant_id,
        "WebSocket upgrade requested"
    );

    ws.on_upgrade(move |socket| handle_socket(socket, state, identity, metadata))
}

/// Handle an established WebSocket connection
#[tracing::instrument(
    name = "ws.connection",
    skip(socket, state, identity, metadata),
    fields(
        subject_id = %identity.subject_id,
        tenant_id = %identity.tenant_id,
    )
)]
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    identity: AuthContext,
    metadata: ConnectionMetadata,
) {
    let connection_start = std::time::Instant::now();

    let (tx, mut rx) = mpsc::channel(state.settings.realtime.outbound_queue_size);
    let handle = Arc::new(ConnectionHandle::new(
        &identity,
        TransportKind::WebSocket,
        metadata,
        tx,
    ));
    let connection_id = handle.id;

    // Queue the connected envelope before registering so it is the first
    // frame the client sees, ahead of any presence fan-out
    let _ = handle.enqueue(Envelope::connected(connection_id).shared());

    if let Err(e) = state.registry.register(handle.clone()).await {
        tracing::warn!(subject_id = %identity.subject_id, error = %e, "Connection rejected");
        let (mut ws_sender, _) = socket.split();
        let envelope = Envelope::error("CONNECTION_LIMIT", e.to_string());
        if let Ok(json) = serde_json::to_string(&envelope) {
            let _ = ws_sender.send(Message::Text(json.into())).await;
        }
        let _ = ws_sender.close().await;
        return;
    }

    ConnectionMetrics::record_opened(TransportKind::WebSocket);

    tracing::info!(
        connection_id = %connection_id,
        "WebSocket connection established"
    );

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Task draining the outbound queue into the socket; also watches the
    // forced-close signal, which works even when the queue is backed up
    let mut close_rx = handle.close_signal();
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                changed = close_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let request = close_rx.borrow_and_update().clone();
                    if let Some(request) = request {
                        let frame = CloseFrame {
                            code: request.code,
                            reason: request.reason.into(),
                        };
                        let _ = ws_sender.send(Message::Close(Some(frame))).await;
                        break;
                    }
                }

                envelope = rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    let text = match serde_json::to_string(&*envelope) {
                        Ok(t) => t,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to serialize envelope");
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Task handling inbound frames
    let state_clone = state.clone();
    let handle_clone = handle.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_frame(msg, &state_clone, &handle_clone).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    // Either task ending tears the connection down
    tokio::select! {
        _ = &mut send_task => {
            tracing::debug!(connection_id = %connection_id, "Send task completed");
            recv_task.abort();
        }
        _ = &mut recv_task => {
            tracing::debug!(connection_id = %connection_id, "Receive task completed");
            send_task.abort();
        }
    }

    // Full disconnection path: channel cleanup and presence via events
    state.registry.remove(connection_id).await;

    ConnectionMetrics::record_closed(TransportKind::WebSocket, connection_start.elapsed());

    tracing::info!(
        connection_id = %connection_id,
        duration_secs = connection_start.elapsed().as_secs_f64(),
        "WebSocket connection closed"
    );
}

/// Process a received WebSocket frame.
/// Returns false if the connection should be closed.
async fn process_frame(msg: Message, state: &AppState, handle: &Arc<ConnectionHandle>) -> bool {
    match msg {
        Message::Text(text) => {
            handle.touch();

            let envelope: ClientEnvelope = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse client envelope");
                    let _ = handle.enqueue(
                        Envelope::error("INVALID_ENVELOPE", e.to_string()).shared(),
                    );
                    return true;
                }
            };

            handle_client_envelope(envelope, state, handle).await;
            true
        }
        Message::Binary(_) => {
            let _ = handle.enqueue(
                Envelope::error("UNSUPPORTED_FORMAT", "Binary frames are not supported")
                    .shared(),
            );
            true
        }
        Message::Ping(_) | Message::Pong(_) => {
            // Axum answers protocol pings itself; both count as activity
            handle.touch();
            true
        }
        Message::Close(_) => {
            tracing::debug!(connection_id = %handle.id, "Received close frame");
            false
        }
    }
}

/// Handle a parsed client envelope
#[tracing::instrument(
    name = "ws.envelope",
    skip(envelope, state, handle),
    fields(
        connection_id = %handle.id,
        subject_id = %handle.subject_id,
    )
)]
async fn handle_client_envelope(
    envelope: ClientEnvelope,
    state: &AppState,
    handle: &Arc<ConnectionHandle>,
) {
    match envelope {
        ClientEnvelope::Subscribe { channel } => {
            match state.fanout.subscribe(handle.id, &channel).await {
                Ok(outcome) => {
                    let _ = handle.enqueue(
                        Envelope::subscribed(outcome.channel, outcome.subscribers).shared(),
                    );
                }
                Err(e) => {
                    let code = if e.is_forbidden() {
                        "FORBIDDEN"
                    } else {
                        "SUBSCRIPTION_ERROR"
                    };
                    let _ = handle.enqueue(Envelope::error(code, e.to_string()).shared());
                }
            }
        }
        ClientEnvelope::Unsubscribe { channel } => {
            match state.fanout.unsubscribe(handle.id, &channel).await {
                Ok(channel) => {
                    let _ = handle.enqueue(Envelope::unsubscribed(channel).shared());
                }
                Err(e) => {
                    let code = if e.is_forbidden() {
                        "FORBIDDEN"
                    } else {
                        "SUBSCRIPTION_ERROR"
                    };
                    let _ = handle.enqueue(Envelope::error(code, e.to_string()).shared());
                }
            }
        }
        ClientEnvelope::Message { channel, data } => {
            handle_client_publish(channel, data, state, handle).await;
        }
        ClientEnvelope::Ping => {
            let _ = handle.enqueue(Envelope::pong().shared());
        }
        ClientEnvelope::Pong => {
            // touch() already cleared the outstanding probe
        }
    }
}

/// Client publish into a channel.
///
/// Publish permission is stricter than subscribe permission: the tenant
/// prefix must match and the identity must carry the publisher role.
async fn handle_client_publish(
    raw_channel: String,
    data: serde_json::Value,
    state: &AppState,
    handle: &Arc<ConnectionHandle>,
) {
    if !handle.has_role(ROLE_PUBLISHER) {
        let _ = handle.enqueue(
            Envelope::error("FORBIDDEN", "Publishing requires the publisher role").shared(),
        );
        return;
    }

    let channel = match crate::channel::ChannelName::qualify(&raw_channel, &handle.tenant_id) {
        Ok(channel) => channel,
        Err(e) => {
            let _ = handle.enqueue(Envelope::error("FORBIDDEN", e.to_string()).shared());
            return;
        }
    };

    let envelope = Envelope::notification(channel.clone(), data).shared();
    let delivered = state.fanout.publish(&channel, envelope).await;

    tracing::debug!(
        connection_id = %handle.id,
        channel = %channel,
        delivered = delivered,
        "Client publish fanned out"
    );
}
