#![forbid(unsafe_code)]

// Signaling module - WebSocket room-sync server and its HTTP surface

pub mod broadcast;
pub mod connection;
pub mod protocol;
pub mod registry;

use crate::config::ServerConfig;
use crate::metrics::ServerMetrics;
use crate::room::RoomManager;
use crate::store::Store;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Largest inbound frame accepted from a client.
const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    manager: Arc<RoomManager>,
    store: Arc<dyn Store>,
    metrics: ServerMetrics,
    config: Arc<ServerConfig>,
    connection_semaphore: Arc<Semaphore>,
}

impl SignalingServer {
    pub fn new(
        manager: Arc<RoomManager>,
        store: Arc<dyn Store>,
        metrics: ServerMetrics,
        config: ServerConfig,
    ) -> Self {
        info!("Max connections: {}", config.max_connections);
        Self {
            manager,
            store,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn manager(&self) -> &Arc<RoomManager> {
        &self.manager
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        let api = Router::new()
            .route("/user", get(crate::auth::routes::get_user))
            .route("/login", post(crate::auth::routes::login));

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .nest("/api/v1", api)
            .with_state(self)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Serves until `shutdown` resolves.
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("0.0.0.0:{}", self.config.port);
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": if server.manager.is_shutting_down() { "shutting_down" } else { "ok" },
        "rooms": server.manager.room_count(),
        "peers": server.manager.total_peer_count(),
        "connections": server.manager.connections().len(),
    }))
}

/// Metrics handler, Prometheus text exposition format.
async fn metrics_handler(State(server): State<SignalingServer>) -> Response {
    let body = server
        .metrics
        .render_prometheus(server.manager.room_count(), server.manager.total_peer_count());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(server): State<SignalingServer>,
) -> Response {
    if server.manager.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down").into_response();
    }

    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade from {}", remote_addr);
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(
                socket,
                remote_addr,
                server.manager,
                server.config,
                server.metrics,
                permit,
            )
        })
}
