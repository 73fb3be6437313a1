use crate::buffer::{BufferStats, IngestBuffer};
use crate::config::GatewayConfig;
use crate::gateway::{ConnectedDevice, Gateway, GatewayStats};
use crate::store::TelemetryStore;
use anyhow::{Context, Result};
use axum::{
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub buffer: Arc<IngestBuffer>,
    pub store: Arc<TelemetryStore>,
}

/// Combined service counters for the stats endpoint
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub buffer: BufferStats,
    pub gateway: GatewayStats,
}

/// Connected device list response
#[derive(Debug, Serialize)]
pub struct DevicesResponse {
    pub devices: Vec<ConnectedDevice>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &GatewayConfig) -> Router {
    let cors = if config.cors_enabled {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/stats", get(get_stats))
        .route("/api/v1/devices", get(list_connected_devices))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Upgrade to the telemetry WebSocket protocol
async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| gateway.serve_socket(socket))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "telemetry-gateway"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    // Check database connectivity
    match sqlx::query("SELECT 1").fetch_one(state.store.pool()).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Buffer and gateway counters
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatsResponse {
        buffer: state.buffer.stats(),
        gateway: state.gateway.stats(),
    })
}

/// Currently registered connections
async fn list_connected_devices(State(state): State<AppState>) -> impl IntoResponse {
    Json(DevicesResponse {
        devices: state.gateway.connected_devices(),
    })
}

/// Start the gateway API server
pub async fn start_api_server(state: AppState, config: &GatewayConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting gateway API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
