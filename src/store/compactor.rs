use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::MemoryStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the log once `threshold` appends have piled up
/// since the last compaction. Exits when the store is the only owner left.
pub async fn run_compactor(store: Arc<MemoryStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        if Arc::strong_count(&store) == 1 {
            debug!("compactor stopping: store dropped");
            return;
        }
        if let Err(e) = compact_if_needed(&store, threshold).await {
            warn!("compaction failed: {e}");
        }
    }
}

/// Returns whether a compaction ran.
pub async fn compact_if_needed(store: &MemoryStore, threshold: u64) -> Result<bool, super::StoreError> {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold.max(1) {
        return Ok(false);
    }
    debug!(appends, threshold, "compacting WAL");
    store.compact().await?;
    Ok(true)
}
