//! Gateway server: WebSocket control channel plus HTTP health and status

use crate::ws::handle_connection;
use aurabridge_acquisition::SessionController;
use aurabridge_core::GatewayConfig;
use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state for every connection.
pub struct GatewayState {
    pub controller: Arc<SessionController>,
    /// Cancelled by the `shutdown` command or a termination signal.
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(controller: Arc<SessionController>, shutdown: CancellationToken) -> Self {
        Self {
            controller,
            shutdown,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already-bound listener until the shutdown token fires.
pub async fn serve(listener: TcpListener, state: Arc<GatewayState>) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("Gateway stopped");
    Ok(())
}

pub async fn start_gateway(config: &GatewayConfig, state: Arc<GatewayState>) -> anyhow::Result<()> {
    let bind_addr: SocketAddr = format!("{}:{}", config.bind.to_addr(), config.port).parse()?;

    info!("AuraBridge Gateway v{} starting", env!("CARGO_PKG_VERSION"));
    info!("  Listening on: {}", bind_addr);
    info!("  WebSocket: ws://{}/ws", bind_addr);
    info!("  Bind mode: {:?}", config.bind);

    let listener = TcpListener::bind(&bind_addr).await?;
    serve(listener, state).await
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "active": state.controller.is_active().await,
        "workers": state.controller.workers().live_count(),
    }))
}

async fn status_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(state.controller.status().await)
}
