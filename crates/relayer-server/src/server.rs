//! HTTP/WebSocket server for the signaling relay.

use std::time::Duration;

use axum::extract::ws::WebSocket;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderValue;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use relayer_core::{ConnectionId, ServerEnvelope};

use crate::connection::{self, HeartbeatConfig};
use crate::router::{self, RelayState};

/// Server configuration. The environment surface mirrors the deployment
/// knobs: PORT, CORS_ORIGIN, WS_HEARTBEAT_INTERVAL (milliseconds).
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub port: u16,
    /// Allowed CORS origin; `*` enables permissive CORS.
    pub cors_origin: String,
    pub heartbeat_interval: Duration,
    /// Idle timeout as a multiple of the heartbeat interval.
    pub idle_timeout_multiplier: u32,
    /// Outbound queue depth per connection.
    pub max_send_queue: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8081,
            cors_origin: "*".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout_multiplier: 3,
            max_send_queue: 256,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("PORT") {
            match port.parse() {
                Ok(port) => config.port = port,
                Err(_) => tracing::warn!(value = %port, "invalid PORT, using default"),
            }
        }
        if let Ok(origin) = std::env::var("CORS_ORIGIN") {
            config.cors_origin = origin;
        }
        if let Ok(ms) = std::env::var("WS_HEARTBEAT_INTERVAL") {
            match ms.parse::<u64>() {
                Ok(ms) => config.heartbeat_interval = Duration::from_millis(ms),
                Err(_) => {
                    tracing::warn!(value = %ms, "invalid WS_HEARTBEAT_INTERVAL, using default")
                }
            }
        }

        config
    }

    pub fn idle_timeout(&self) -> Duration {
        self.heartbeat_interval * self.idle_timeout_multiplier
    }
}

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: RelayState,
    pub message_tx: mpsc::Sender<(ConnectionId, String)>,
    pub heartbeat: HeartbeatConfig,
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState, cors_origin: &str) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/health/live", get(live_handler))
        .route("/health/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(cors_layer(cors_origin))
}

fn cors_layer(origin: &str) -> CorsLayer {
    if origin == "*" {
        return CorsLayer::permissive();
    }
    match origin.parse::<HeaderValue>() {
        Ok(value) => CorsLayer::new().allow_origin(value),
        Err(_) => {
            tracing::warn!(origin = %origin, "invalid CORS origin, falling back to permissive");
            CorsLayer::permissive()
        }
    }
}

/// Create and start the relay. Returns a handle that keeps the background
/// tasks alive.
pub async fn start(config: RelayConfig) -> Result<ServerHandle, std::io::Error> {
    let relay = RelayState::new(config.max_send_queue);

    let (message_tx, message_rx) = mpsc::channel::<(ConnectionId, String)>(1024);
    let dispatcher = tokio::spawn(router::process_messages(message_rx, relay.clone()));

    let state = AppState {
        relay,
        message_tx,
        heartbeat: HeartbeatConfig {
            interval: config.heartbeat_interval,
            idle_timeout: config.idle_timeout(),
        },
    };

    let app = build_router(state, &config.cors_origin);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "signaling relay started");

    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server,
        _dispatcher: dispatcher,
    })
}

/// Handle returned by [`start`] that keeps the background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _dispatcher: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Accept a new signaling connection: mint an id, register, greet, then
/// hand the socket to the connection tasks.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = ConnectionId::new();
    let rx = match state.relay.registry.register(conn_id.clone()) {
        Ok(rx) => rx,
        Err(err) => {
            // Can only mean an id collision: an internal bug, never fatal
            // to the process. Drop the new connection and keep serving.
            tracing::error!(conn_id = %conn_id, error = %err, "registration failed, dropping connection");
            return;
        }
    };

    state.relay.metrics.connections_total.increment();
    state.relay.metrics.connections_active.increment();
    tracing::info!(conn_id = %conn_id, "client connected");

    state.relay.registry.send(&conn_id, ServerEnvelope::welcome());

    connection::handle_ws_connection(
        socket,
        conn_id,
        rx,
        state.relay.clone(),
        state.message_tx.clone(),
        state.heartbeat,
    )
    .await;
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
    rooms: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.relay.registry.count(),
        rooms: state.relay.rooms.room_count(),
    })
}

async fn live_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "alive",
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

async fn ready_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ready",
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.relay.metrics.render_prometheus()
}
