use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vantage_realtime_service::config::Settings;
use vantage_realtime_service::coordination::PeerSubscriber;
use vantage_realtime_service::liveness::LivenessMonitor;
use vantage_realtime_service::server::{create_app, AppState};
use vantage_realtime_service::shutdown::{GracefulShutdown, ShutdownConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    // Create application state
    let state = AppState::new(settings.clone())?;
    tracing::info!(
        server_id = %settings.coordination.server_id,
        "Application state initialized"
    );

    // Start the peer fan-out subscriber in background
    let peer_subscriber = PeerSubscriber::new(
        settings.coordination.clone(),
        state.store.clone(),
        state.fanout.clone(),
        state.shutdown.subscribe(),
    );
    let peer_handle = tokio::spawn(async move {
        peer_subscriber.run().await;
    });

    // Start the liveness monitor in background
    let monitor = LivenessMonitor::new(settings.liveness.clone(), state.registry.clone())
        .with_mirrors(state.fanout.clone(), state.presence.clone());
    let monitor_shutdown = state.shutdown.subscribe();
    let monitor_handle = tokio::spawn(async move {
        monitor.run(monitor_shutdown).await;
    });

    // Create Axum app
    let app = create_app(state.clone());

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    let graceful = Arc::new(GracefulShutdown::with_config(
        state.registry.clone(),
        state.shutdown.clone(),
        ShutdownConfig {
            reconnect_retry_ms: settings.realtime.reconnect_retry_ms,
            ..Default::default()
        },
    ));

    // Run server with graceful shutdown
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal_handler(graceful))
    .await?;

    // Wait for background tasks to finish
    tracing::info!("Waiting for background tasks to finish...");
    let _ = tokio::join!(peer_handle, monitor_handle);

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal_handler(graceful: Arc<GracefulShutdown>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let reason = tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
            "interrupt"
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
            "terminate"
        }
    };

    // Notify clients and stop background tasks before sockets close
    graceful.execute(reason).await;
}
