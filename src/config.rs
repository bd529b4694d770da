#![forbid(unsafe_code)]

// Server configuration, loaded once from environment variables in main.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_MAX_LATENT_ROOMS: usize = 10;
pub const DEFAULT_LATENT_ROOM_MAX_AGE_HOURS: u64 = 24;
pub const DEFAULT_ROOM_CLEANUP_INTERVAL_SECS: u64 = 30 * 60;
pub const DEFAULT_ROOM_MAX_AGE_SECS: u64 = 60 * 60;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_CONNECT_RATE_LIMIT: u32 = 10;
pub const DEFAULT_CONNECT_RATE_WINDOW_SECS: u64 = 60;
/// Cap on a single inbound WebSocket message (1 MiB).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// TLS is terminated by a reverse proxy; these are surfaced in startup
    /// logs so the deployment keeps one source of truth for the paths.
    pub use_https: bool,
    pub ssl_cert_path: Option<PathBuf>,
    pub ssl_key_path: Option<PathBuf>,

    /// Cap on pre-created rooms that are still empty.
    pub max_latent_rooms: usize,
    /// How long an empty pre-created room survives.
    pub latent_room_max_age: Duration,
    /// Where the latent-room list is persisted.
    pub rooms_file: PathBuf,

    /// How often the janitor sweeps for abandoned rooms.
    pub room_cleanup_interval: Duration,
    /// How long an empty ad-hoc room survives before the janitor evicts it.
    pub room_max_age: Duration,

    pub max_connections: usize,
    /// Connection attempts allowed per remote address per window.
    pub connect_rate_limit: u32,
    pub connect_rate_window: Duration,
    /// Maximum size of one inbound WebSocket message.
    pub max_buffer_size: usize,

    /// Optional bearer token protecting GET /metrics.
    pub metrics_token: Option<String>,
}

impl ServerConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            use_https: env_flag("USE_HTTPS"),
            ssl_cert_path: std::env::var("SSL_CERT_PATH").ok().map(PathBuf::from),
            ssl_key_path: std::env::var("SSL_KEY_PATH").ok().map(PathBuf::from),
            max_latent_rooms: env_parse("MAX_LATENT_ROOMS", DEFAULT_MAX_LATENT_ROOMS),
            latent_room_max_age: Duration::from_secs(
                env_parse(
                    "LATENT_ROOM_MAX_AGE_HOURS",
                    DEFAULT_LATENT_ROOM_MAX_AGE_HOURS,
                ) * 3600,
            ),
            rooms_file: std::env::var("ROOMS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/rooms.json")),
            room_cleanup_interval: Duration::from_secs(env_parse(
                "ROOM_CLEANUP_INTERVAL_SECS",
                DEFAULT_ROOM_CLEANUP_INTERVAL_SECS,
            )),
            room_max_age: Duration::from_secs(env_parse(
                "ROOM_MAX_AGE_SECS",
                DEFAULT_ROOM_MAX_AGE_SECS,
            )),
            max_connections: env_parse("MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS),
            connect_rate_limit: env_parse("CONNECT_RATE_LIMIT", DEFAULT_CONNECT_RATE_LIMIT),
            connect_rate_window: Duration::from_secs(env_parse(
                "CONNECT_RATE_WINDOW_SECS",
                DEFAULT_CONNECT_RATE_WINDOW_SECS,
            )),
            max_buffer_size: env_parse("MAX_BUFFER_SIZE", DEFAULT_MAX_BUFFER_SIZE),
            metrics_token: std::env::var("METRICS_TOKEN").ok(),
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes")
    )
}
