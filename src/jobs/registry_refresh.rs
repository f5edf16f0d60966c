//! Background job: reload the tenant catalog.
//!
//! Each tick builds a fresh snapshot from the tenant source and swaps it in.
//! A failed load keeps the previous snapshot.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

use crate::store::TenantSource;
use crate::tenant::{StrategyRegistry, TenantRegistry};

/// Spawn the refresh task. Stops when `shutdown` flips to `true`.
pub fn spawn(
    registry: TenantRegistry,
    source: Arc<dyn TenantSource>,
    strategies: Arc<StrategyRegistry>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        // the first tick fires immediately; startup already loaded the catalog
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
            if let Err(e) = refresh_once(&registry, source.as_ref(), &strategies).await {
                tracing::error!("tenant refresh failed, keeping previous snapshot: {:#}", e);
            }
        }
        tracing::debug!("tenant refresh job stopped");
    })
}

/// Reload once and warn about tenants whose tags have no implementation.
pub async fn refresh_once(
    registry: &TenantRegistry,
    source: &dyn TenantSource,
    strategies: &StrategyRegistry,
) -> anyhow::Result<usize> {
    let count = registry.refresh(source).await?;
    let snapshot = registry.snapshot().await;
    for problem in strategies.unresolved_tags(&snapshot.tenants()) {
        tracing::warn!("{}", problem);
    }
    tracing::info!(tenants = count, "tenant catalog refreshed");
    Ok(count)
}
