#![forbid(unsafe_code)]

mod config;
mod janitor;
mod metrics;
mod room;
mod signaling;
mod turn;

use anyhow::Result;
use config::ServerConfig;
use metrics::ServerMetrics;
use room::store::LatentRoomStore;
use room::RoomRegistry;
use signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turn::TurnConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Huddle - Starting signaling server");

    let config = ServerConfig::from_env();
    if config.use_https {
        info!(
            "USE_HTTPS set — expecting TLS termination at the reverse proxy (cert: {:?}, key: {:?})",
            config.ssl_cert_path, config.ssl_key_path
        );
    }

    let metrics = ServerMetrics::new();

    // Restore pre-created rooms from disk, dropping any past their age cap
    let store = LatentRoomStore::new(&config.rooms_file);
    let records = store.load(config.latent_room_max_age).await;
    info!(
        "Loaded {} pre-created room(s) from {:?}",
        records.len(),
        config.rooms_file
    );

    let registry = Arc::new(RoomRegistry::new(
        Some(store),
        config.max_latent_rooms,
        config.latent_room_max_age,
        metrics.clone(),
    ));
    registry.restore(records);
    // Drop expired entries from disk too
    registry.persist_latent().await;

    // Load TURN config from environment (optional)
    let turn_config = TurnConfig::from_env();
    if let Some(ref tc) = turn_config {
        info!("TURN configured: {}", tc.url);
    } else {
        info!("No TURN configured (set TURN_SERVER_URL to enable)");
    }

    let janitor = janitor::spawn(
        registry.clone(),
        config.room_cleanup_interval,
        config.room_max_age,
    );

    let server = SignalingServer::new(registry.clone(), turn_config, metrics, &config);
    let port = config.port;

    info!("Starting signaling server on port {}", port);

    // Run server with graceful shutdown
    tokio::select! {
        result = server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            registry.persist_latent().await;
        }
    }

    janitor.abort();
    info!("Server shutdown complete");
    Ok(())
}
