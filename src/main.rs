#![forbid(unsafe_code)]

use anyhow::Result;
use partysync::config::ServerConfig;
use partysync::db;
use partysync::metrics::ServerMetrics;
use partysync::room::RoomManager;
use partysync::signaling::SignalingServer;
use partysync::store::WriteThrough;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "partysync=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("partysync - Starting server");

    let config = ServerConfig::from_env();
    let metrics = ServerMetrics::new();

    // Store connectivity is the one fatal startup error
    let store = db::connect(config.database_url.as_deref()).await?;

    let persistence = WriteThrough::new(store.clone(), config.persist, metrics.clone());
    let room_manager = Arc::new(RoomManager::new(
        persistence,
        metrics.clone(),
        config.room_capacity,
        config.write_timeout,
    ));
    let reaper = room_manager.spawn_reaper(config.liveness);

    let signaling_server = SignalingServer::new(room_manager.clone(), store, metrics, config);

    let shutdown_manager = room_manager.clone();
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Received Ctrl+C, shutting down...");
        shutdown_manager.shutdown().await;
    };

    if let Err(e) = signaling_server.serve(shutdown).await {
        error!("Signaling server error: {}", e);
    }

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    info!("Server shutdown complete");
    Ok(())
}
