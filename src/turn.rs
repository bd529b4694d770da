#![forbid(unsafe_code)]

// ICE server assembly for GET /config.
// Supports static TURN credentials or coturn time-limited credentials
// (HMAC-SHA1 per the TURN REST API spec, coturn --use-auth-secret).

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// TURN server configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// TURN server URL (e.g. "turn:example.com:3478")
    pub url: String,
    /// Static long-term credentials
    pub username: Option<String>,
    pub credential: Option<String>,
    /// Shared secret for generating time-limited credentials; takes
    /// precedence over the static pair when set.
    pub secret: Option<String>,
    /// Credential TTL in seconds (default: 24h)
    pub ttl_secs: u64,
}

/// ICE server entry sent to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl TurnConfig {
    /// Load from environment variables. Returns None if TURN_SERVER_URL is not set.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("TURN_SERVER_URL").ok()?;
        let username = std::env::var("TURN_SERVER_USERNAME").ok();
        let credential = std::env::var("TURN_SERVER_CREDENTIAL").ok();
        let secret = std::env::var("TURN_SERVER_SECRET").ok();
        let ttl_secs = std::env::var("TURN_CREDENTIAL_TTL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(86400); // 24 hours default

        Some(Self {
            url,
            username,
            credential,
            secret,
            ttl_secs,
        })
    }

    /// The ICE server entry for this TURN server.
    ///
    /// With a shared secret: username = "expiry_timestamp:label",
    /// credential = base64(HMAC-SHA1(secret, username)).
    pub fn ice_server(&self, label: &str) -> IceServer {
        if let Some(secret) = &self.secret {
            let expiry = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
                + self.ttl_secs;

            let username = format!("{expiry}:{label}");

            let mut mac =
                HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
            mac.update(username.as_bytes());
            let credential =
                base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

            return IceServer {
                urls: vec![self.url.clone()],
                username: Some(username),
                credential: Some(credential),
            };
        }

        IceServer {
            urls: vec![self.url.clone()],
            username: self.username.clone(),
            credential: self.credential.clone(),
        }
    }
}

/// The full ICE server list for clients: STUN first, then TURN if configured.
pub fn ice_servers(stun_url: &str, turn: Option<&TurnConfig>) -> Vec<IceServer> {
    let mut servers = vec![IceServer {
        urls: vec![stun_url.to_string()],
        username: None,
        credential: None,
    }];
    if let Some(tc) = turn {
        servers.push(tc.ice_server("huddle"));
    }
    servers
}
