//! Shared harness: the full pipeline over in-memory backends.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use approval_pipeline::app::{AppState, Backends};
use approval_pipeline::bus::memory::MemoryBus;
use approval_pipeline::models::summary::{ApprovalDetail, ApprovalSummary, SummaryKey};
use approval_pipeline::models::tenant::TenantInfo;
use approval_pipeline::pipeline::RetryPolicy;
use approval_pipeline::store::memory::MemoryStore;
use approval_pipeline::store::{ApprovalStore, StoreError};
use approval_pipeline::tenant::StrategyRegistry;
use async_trait::async_trait;

pub struct TestPipeline {
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub bus: Arc<MemoryBus>,
}

pub fn tenant(tenant_id: &str, strategy: &str) -> TenantInfo {
    TenantInfo {
        tenant_id: tenant_id.into(),
        doc_type_id: uuid::Uuid::new_v4(),
        name: format!("{} tenant", tenant_id),
        strategy_tag: strategy.into(),
        validation_tag: "default".into(),
        enabled: true,
        routing: Default::default(),
        validation: Default::default(),
        max_attempts: None,
    }
}

pub async fn pipeline(tenants: Vec<TenantInfo>) -> TestPipeline {
    pipeline_with_store(tenants, None).await
}

/// Pipeline whose approval writes go to `store` instead of the memory store.
/// Audit records and the tenant catalog still live in the memory store.
pub async fn pipeline_with_store(
    tenants: Vec<TenantInfo>,
    store: Option<Arc<dyn ApprovalStore>>,
) -> TestPipeline {
    let memory = Arc::new(MemoryStore::with_tenants(tenants));
    let bus = Arc::new(MemoryBus::default());
    let mut backends = Backends::in_memory(memory.clone(), bus.clone());
    if let Some(store) = store {
        backends.store = store;
    }

    let state = Arc::new(AppState::assemble(
        backends,
        StrategyRegistry::builtin(),
        RetryPolicy::immediate(3),
        RetryPolicy::immediate(3),
    ));
    state.load_tenants().await.unwrap();

    TestPipeline { state, store: memory, bus }
}

/// Pipeline whose approval writes fail until the returned store is set healthy.
pub async fn pipeline_with_flaky_store(tenants: Vec<TenantInfo>) -> (TestPipeline, Arc<FlakyStore>) {
    let store = Arc::new(FlakyStore::default());
    let p = pipeline_with_store(tenants, Some(store.clone() as Arc<dyn ApprovalStore>)).await;
    (p, store)
}

impl TestPipeline {
    /// Process main and retry topics until both are empty.
    pub async fn drain(&self) -> usize {
        self.state.worker_pool(1).drain().await.unwrap()
    }
}

pub fn key(tenant_id: &str, document: &str, fiscal_year: &str) -> SummaryKey {
    SummaryKey {
        tenant_id: tenant_id.into(),
        document_key: document.into(),
        fiscal_year: fiscal_year.into(),
    }
}

/// Store that fails every write until switched healthy.
#[derive(Default)]
pub struct FlakyStore {
    pub healthy: AtomicBool,
    pub detail_writes: AtomicUsize,
    inner: MemoryStore,
}

impl FlakyStore {
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn writes(&self) -> usize {
        self.detail_writes.load(Ordering::SeqCst)
    }

    pub fn summary_count(&self) -> usize {
        self.inner.summary_count()
    }
}

#[async_trait]
impl ApprovalStore for FlakyStore {
    async fn upsert_detail(&self, detail: &ApprovalDetail) -> Result<(), StoreError> {
        self.detail_writes.fetch_add(1, Ordering::SeqCst);
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        self.inner.upsert_detail(detail).await
    }

    async fn upsert_summary(&self, summary: &ApprovalSummary) -> Result<(), StoreError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        self.inner.upsert_summary(summary).await
    }

    async fn get_summary(&self, key: &SummaryKey) -> Result<Option<ApprovalSummary>, StoreError> {
        self.inner.get_summary(key).await
    }
}
