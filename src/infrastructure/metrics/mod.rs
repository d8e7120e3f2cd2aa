//! Prometheus metrics for the realtime service.
//!
//! Counters are recorded at the call sites; gauges are refreshed from live
//! state when the `/metrics` endpoint is scraped.

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, TextEncoder,
};

use crate::registry::TransportKind;

/// Prefix for all metrics
const METRIC_PREFIX: &str = "vantage";

lazy_static! {
    /// Total number of active connections
    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_connections_active", METRIC_PREFIX),
        "Total number of active connections"
    ).unwrap();

    /// Connections opened, by transport
    pub static ref CONNECTIONS_OPENED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_connections_opened_total", METRIC_PREFIX),
        "Total connections opened",
        &["transport"]
    ).unwrap();

    /// Connections closed, by transport
    pub static ref CONNECTIONS_CLOSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_connections_closed_total", METRIC_PREFIX),
        "Total connections closed",
        &["transport"]
    ).unwrap();

    /// Connection lifetime distribution
    pub static ref CONNECTION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        format!("{}_connection_duration_seconds", METRIC_PREFIX),
        "Connection duration in seconds",
        &["transport"],
        vec![1.0, 10.0, 60.0, 300.0, 1800.0, 7200.0]
    ).unwrap();

    /// Channels with at least one local subscriber
    pub static ref CHANNELS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_channels_active", METRIC_PREFIX),
        "Channels with at least one local subscriber"
    ).unwrap();

    /// Envelopes published, by scope
    pub static ref ENVELOPES_PUBLISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_envelopes_published_total", METRIC_PREFIX),
        "Total envelopes published",
        &["scope"]
    ).unwrap();

    /// Envelopes delivered to local connections
    pub static ref ENVELOPES_DELIVERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_envelopes_delivered_total", METRIC_PREFIX),
        "Total envelopes delivered to local connections"
    ).unwrap();

    /// Envelopes dropped (failed local deliveries)
    pub static ref ENVELOPES_DROPPED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_envelopes_dropped_total", METRIC_PREFIX),
        "Total envelopes dropped due to failed local delivery"
    ).unwrap();

    /// Subscribe requests rejected (tenant mismatch or invalid name)
    pub static ref SUBSCRIBES_REJECTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_subscribes_rejected_total", METRIC_PREFIX),
        "Total subscribe requests rejected"
    ).unwrap();

    /// Peer fan-out events received from the coordination plane
    pub static ref PEER_EVENTS_RECEIVED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_peer_events_received_total", METRIC_PREFIX),
        "Total peer fan-out events received"
    ).unwrap();

    /// Presence updates, by resulting status
    pub static ref PRESENCE_UPDATES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_presence_updates_total", METRIC_PREFIX),
        "Total presence updates",
        &["status"]
    ).unwrap();

    /// Online users mirrored in the coordination store
    pub static ref PRESENCE_ONLINE_USERS: IntGauge = register_int_gauge!(
        format!("{}_presence_online_users", METRIC_PREFIX),
        "Online users visible across the fleet"
    ).unwrap();

    /// Connections disconnected by the liveness monitor
    pub static ref LIVENESS_DISCONNECTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_liveness_disconnects_total", METRIC_PREFIX),
        "Total connections torn down by the liveness monitor"
    ).unwrap();

    /// Connections per tenant
    pub static ref CONNECTIONS_BY_TENANT: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_connections_by_tenant", METRIC_PREFIX),
        "Active connections per tenant",
        &["tenant"]
    ).unwrap();
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording connection metrics
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_opened(transport: TransportKind) {
        CONNECTIONS_OPENED_TOTAL
            .with_label_values(&[transport.as_str()])
            .inc();
    }

    pub fn record_closed(transport: TransportKind, duration: Duration) {
        CONNECTIONS_CLOSED_TOTAL
            .with_label_values(&[transport.as_str()])
            .inc();
        CONNECTION_DURATION_SECONDS
            .with_label_values(&[transport.as_str()])
            .observe(duration.as_secs_f64());
    }
}

/// Helper struct for recording fan-out metrics
pub struct FanoutMetrics;

impl FanoutMetrics {
    pub fn record_published(scope: &str) {
        ENVELOPES_PUBLISHED_TOTAL.with_label_values(&[scope]).inc();
    }

    pub fn record_delivered(count: u64) {
        ENVELOPES_DELIVERED_TOTAL.inc_by(count);
    }

    pub fn record_dropped() {
        ENVELOPES_DROPPED_TOTAL.inc();
    }

    pub fn record_subscribe_rejected() {
        SUBSCRIBES_REJECTED_TOTAL.inc();
    }

    pub fn record_peer_received() {
        PEER_EVENTS_RECEIVED_TOTAL.inc();
    }
}

/// Helper struct for recording presence metrics
pub struct PresenceMetrics;

impl PresenceMetrics {
    pub fn record_update(status: &str) {
        PRESENCE_UPDATES_TOTAL.with_label_values(&[status]).inc();
    }
}

/// Helper struct for recording liveness metrics
pub struct LivenessMetrics;

impl LivenessMetrics {
    pub fn record_dead() {
        LIVENESS_DISCONNECTS_TOTAL.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics() {
        ConnectionMetrics::record_opened(TransportKind::WebSocket);
        FanoutMetrics::record_published("channel");
        PresenceMetrics::record_update("online");

        let output = encode_metrics().unwrap();
        assert!(output.contains("vantage_connections_opened_total"));
        assert!(output.contains("vantage_envelopes_published_total"));
    }
}
