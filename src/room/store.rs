#![forbid(unsafe_code)]

// On-disk persistence for pre-created rooms: a JSON array, rewritten
// whole on every mutation. Write goes to a temp file then renames into
// place so a crash mid-write never corrupts the list.

use crate::signaling::protocol::now_ms;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

/// One persisted pre-created room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatentRoomRecord {
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub creator_token: String,
    /// Creation time in epoch milliseconds.
    pub created_at: u64,
    pub max_participants: usize,
}

#[derive(Debug, Clone)]
pub struct LatentRoomStore {
    path: PathBuf,
}

impl LatentRoomStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted rooms, discarding entries older than `max_age`.
    /// A missing or unreadable file yields an empty list — the in-memory
    /// registry is authoritative for the session either way.
    pub async fn load(&self, max_age: Duration) -> Vec<LatentRoomRecord> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("Failed to read room store {:?}: {}", self.path, e);
                return Vec::new();
            }
        };

        let records: Vec<LatentRoomRecord> = match serde_json::from_str(&contents) {
            Ok(r) => r,
            Err(e) => {
                warn!("Ignoring malformed room store {:?}: {}", self.path, e);
                return Vec::new();
            }
        };

        let cutoff = now_ms().saturating_sub(max_age.as_millis() as u64);
        let total = records.len();
        let live: Vec<LatentRoomRecord> = records
            .into_iter()
            .filter(|r| r.created_at >= cutoff)
            .collect();

        if live.len() < total {
            info!(
                "Discarded {} expired pre-created room(s) from {:?}",
                total - live.len(),
                self.path
            );
        }

        live
    }

    /// Replace the persisted list. Callers snapshot the latent set first and
    /// invoke this without holding any registry lock.
    pub async fn rewrite(&self, records: &[LatentRoomRecord]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_string_pretty(records)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json.as_bytes()).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
