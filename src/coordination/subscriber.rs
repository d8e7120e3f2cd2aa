//! Background task receiving peer fan-out events from the coordination plane.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::CoordinationConfig;
use crate::fanout::FanoutEngine;
use crate::metrics::FanoutMetrics;

use super::store::CoordinationStore;
use super::types::PeerEvent;

/// Subscribes to the fan-out topics and delivers peer-published envelopes to
/// this instance's local connections.
pub struct PeerSubscriber {
    config: CoordinationConfig,
    store: Arc<dyn CoordinationStore>,
    fanout: Arc<FanoutEngine>,
    shutdown: broadcast::Receiver<()>,
}

impl PeerSubscriber {
    pub fn new(
        config: CoordinationConfig,
        store: Arc<dyn CoordinationStore>,
        fanout: Arc<FanoutEngine>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            store,
            fanout,
            shutdown,
        }
    }

    /// Run the subscriber until shutdown or the subscription ends.
    pub async fn run(mut self) {
        let topics = self.config.fanout_topics();

        let mut messages = match self.store.subscribe(&topics).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::error!(error = %e, "Failed to subscribe to fan-out topics");
                return;
            }
        };

        tracing::info!(
            server_id = %self.config.server_id,
            topics = ?topics,
            "Peer subscriber started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.recv() => {
                    tracing::info!("Peer subscriber received shutdown signal");
                    break;
                }

                msg = messages.recv() => {
                    match msg {
                        Some(msg) => self.handle_message(&msg.topic, &msg.payload).await,
                        None => {
                            tracing::warn!("Fan-out topic stream ended");
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("Peer subscriber stopped");
    }

    async fn handle_message(&self, topic: &str, payload: &str) {
        let event: PeerEvent = match serde_json::from_str(payload) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    topic = %topic,
                    "Failed to parse peer fan-out event"
                );
                return;
            }
        };

        // Skip our own publishes, already delivered locally
        if event.origin() == self.config.server_id {
            return;
        }

        FanoutMetrics::record_peer_received();

        let delivered = self.fanout.deliver_peer_event(event).await;

        tracing::debug!(
            topic = %topic,
            delivered = delivered,
            "Handled peer fan-out event"
        );
    }
}
