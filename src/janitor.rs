#![forbid(unsafe_code)]

// Periodic eviction of abandoned rooms.

use crate::room::RoomRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Spawns the background sweep. Empty ad-hoc rooms older than
/// `room_max_age` are dropped; empty pre-created rooms age against their own
/// limit inside the registry.
pub fn spawn(
    registry: Arc<RoomRegistry>,
    interval: Duration,
    room_max_age: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the first tick fires immediately; skip it

        loop {
            ticker.tick().await;
            let removed = registry.cleanup_abandoned_rooms(room_max_age).await;
            if removed > 0 {
                info!("Janitor evicted {} abandoned room(s)", removed);
            } else {
                debug!("Janitor sweep found nothing to evict");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ServerMetrics;
    use crate::room::RoomRegistry;

    #[tokio::test]
    async fn sweep_evicts_expired_latent_rooms() {
        // Latent rooms expire immediately so a short real-time sleep is enough.
        let registry = Arc::new(RoomRegistry::new(
            None,
            10,
            Duration::ZERO,
            ServerMetrics::new(),
        ));
        registry
            .pre_create_room(Some("SWEEP1".into()), None, None)
            .await
            .unwrap();
        assert!(registry.room_exists("SWEEP1"));

        let handle = spawn(registry.clone(), Duration::from_millis(20), Duration::from_secs(3600));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!registry.room_exists("SWEEP1"));

        handle.abort();
    }
}
