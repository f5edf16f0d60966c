//! Background job: drop expired approver lookups from the identity cache.
//!
//! Lookups only refresh entries they hit, so aliases seen once would stay in
//! memory forever without a sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

use crate::identity::CachedIdentityResolver;

/// Spawn the eviction task. Stops when `shutdown` flips to `true`.
pub fn spawn(
    cache: Arc<CachedIdentityResolver>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        // the first tick fires immediately and the cache starts empty
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            let evicted = cache.evict_expired();
            if evicted > 0 {
                tracing::debug!(evicted, remaining = cache.len(), "identity cache swept");
            }
        }
        tracing::debug!("identity cache eviction job stopped");
    })
}
