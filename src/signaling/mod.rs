#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server and HTTP surface

pub mod admission;
pub mod connection;
pub mod limiter;
pub mod protocol;

use crate::config::ServerConfig;
use crate::metrics::ServerMetrics;
use crate::room::RoomRegistry;
use crate::turn::{self, TurnConfig, DEFAULT_STUN_URL};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use limiter::ConnectLimiter;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{info, warn};

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    registry: Arc<RoomRegistry>,
    turn_config: Option<Arc<TurnConfig>>,
    stun_url: String,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    connect_limiter: Arc<ConnectLimiter>,
    max_message_size: usize,
    metrics_token: Option<String>,
}

impl SignalingServer {
    /// Creates a new signaling server
    pub fn new(
        registry: Arc<RoomRegistry>,
        turn_config: Option<TurnConfig>,
        metrics: ServerMetrics,
        config: &ServerConfig,
    ) -> Self {
        let mut max_connections = config.max_connections;
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default 10000");
            max_connections = 10_000;
        }
        info!("Max connections: {}", max_connections);

        let stun_url = std::env::var("STUN_SERVER_URL").unwrap_or_else(|_| DEFAULT_STUN_URL.into());

        Self {
            registry,
            turn_config: turn_config.map(Arc::new),
            stun_url,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            connect_limiter: Arc::new(ConnectLimiter::new(
                config.connect_rate_limit,
                config.connect_rate_window,
            )),
            max_message_size: config.max_buffer_size,
            metrics_token: config.metrics_token.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/config", get(config_handler))
            .route("/metrics", get(metrics_handler))
            .route("/api/rooms", post(crate::room::api::create_room))
            .with_state(self)
            .layer(CorsLayer::permissive())
            .fallback_service(ServeDir::new("web"))
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let total_rooms = server.registry.room_count();
    let total_participants = server.registry.total_participant_count().await;
    Json(serde_json::json!({
        "totalRooms": total_rooms,
        "totalParticipants": total_participants,
        "peakParticipants": server.metrics.participants_peak(),
        "uptime": server.metrics.uptime_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// ICE server configuration for clients
async fn config_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let servers = turn::ice_servers(&server.stun_url, server.turn_config.as_deref());
    Json(serde_json::json!({ "iceServers": servers }))
}

/// Metrics handler — Prometheus text exposition format.
/// Protected by an optional bearer token.
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = &server.metrics_token {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let rooms = server.registry.room_count();
    let participants = server.registry.total_participant_count().await;
    let body = server.metrics.render_prometheus(rooms, participants);
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
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(server): State<SignalingServer>,
) -> Response {
    // Per-address throttle: refused upgrades carry no envelope.
    if !server.connect_limiter.allow(addr.ip()) {
        warn!("Connection rate limit exceeded for {}", addr.ip());
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(server.max_message_size)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, server.registry, server.metrics, permit)
        })
}
