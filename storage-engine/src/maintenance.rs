//! Background upkeep for the embedded store.

use crate::SledCache;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Spawns a task that purges expired records every `interval`.
///
/// Each sweep runs on the blocking pool since it walks the whole store.
/// Abort the returned handle to stop the sweeper.
pub fn spawn_expiry_sweeper(cache: SledCache, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Starting expiry sweeper with interval of {:?}", interval);

        loop {
            tokio::time::sleep(interval).await;

            let sweeper = cache.clone();
            match tokio::task::spawn_blocking(move || sweeper.run_gc()).await {
                Ok(Ok(purged)) if purged > 0 => {
                    info!("Expiry sweep: purged {} expired records", purged)
                }
                Ok(Ok(_)) => debug!("Expiry sweep: no expired records found"),
                Ok(Err(e)) => warn!("Expiry sweep failed: {}", e),
                Err(e) => error!("Expiry sweep task panicked: {}", e),
            }
        }
    })
}
