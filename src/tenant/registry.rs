//! Read-mostly tenant catalog.
//!
//! Readers take an `Arc` to the current snapshot and never see a partially
//! updated catalog; a refresh builds a new snapshot and swaps it in whole.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::models::tenant::TenantInfo;
use crate::store::TenantSource;

/// Tenant ids are matched case-insensitively (they are usually GUIDs).
pub fn normalize_tenant_id(tenant_id: &str) -> String {
    tenant_id.trim().to_ascii_lowercase()
}

#[derive(Debug, Default)]
pub struct TenantSnapshot {
    tenants: HashMap<String, Arc<TenantInfo>>,
    loaded_at: Option<DateTime<Utc>>,
}

impl TenantSnapshot {
    pub fn new(tenants: Vec<TenantInfo>) -> Self {
        let tenants = tenants
            .into_iter()
            .map(|t| (normalize_tenant_id(&t.tenant_id), Arc::new(t)))
            .collect();
        Self {
            tenants,
            loaded_at: Some(Utc::now()),
        }
    }

    pub fn get(&self, tenant_id: &str) -> Option<Arc<TenantInfo>> {
        self.tenants.get(&normalize_tenant_id(tenant_id)).cloned()
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    /// Tenants sorted by id.
    pub fn tenants(&self) -> Vec<Arc<TenantInfo>> {
        let mut all: Vec<_> = self.tenants.values().cloned().collect();
        all.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        all
    }
}

/// Shared, cheaply-cloneable registry handle.
#[derive(Clone, Default)]
pub struct TenantRegistry(Arc<RwLock<Arc<TenantSnapshot>>>);

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenants(tenants: Vec<TenantInfo>) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(TenantSnapshot::new(tenants)))))
    }

    pub async fn snapshot(&self) -> Arc<TenantSnapshot> {
        self.0.read().await.clone()
    }

    /// Replace the entire catalog.
    pub async fn replace(&self, tenants: Vec<TenantInfo>) {
        let snapshot = Arc::new(TenantSnapshot::new(tenants));
        *self.0.write().await = snapshot;
    }

    /// Reload from `source`. On failure the previous snapshot stays in place.
    pub async fn refresh(&self, source: &dyn TenantSource) -> anyhow::Result<usize> {
        let tenants = source.load_tenants().await?;
        let count = tenants.len();
        self.replace(tenants).await;
        Ok(count)
    }
}
