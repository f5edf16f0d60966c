//! In-process store for local mode and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;

use super::{ApprovalStore, StoreError, TenantSource};
use crate::audit::AuditSink;
use crate::models::audit::AuditRecord;
use crate::models::summary::{ApprovalDetail, ApprovalSummary, SummaryKey};
use crate::models::tenant::TenantInfo;

#[derive(Default)]
pub struct MemoryStore {
    summaries: DashMap<SummaryKey, ApprovalSummary>,
    details: DashMap<SummaryKey, ApprovalDetail>,
    audit: RwLock<Vec<AuditRecord>>,
    tenants: RwLock<Vec<TenantInfo>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenants(tenants: Vec<TenantInfo>) -> Self {
        Self {
            tenants: RwLock::new(tenants),
            ..Self::default()
        }
    }

    pub async fn set_tenants(&self, tenants: Vec<TenantInfo>) {
        *self.tenants.write().await = tenants;
    }

    pub fn summary_count(&self) -> usize {
        self.summaries.len()
    }

    pub fn detail_count(&self) -> usize {
        self.details.len()
    }

    pub fn detail(&self, key: &SummaryKey) -> Option<ApprovalDetail> {
        self.details.get(key).map(|d| d.clone())
    }

    pub async fn audit_records(&self) -> Vec<AuditRecord> {
        self.audit.read().await.clone()
    }
}

#[async_trait]
impl ApprovalStore for MemoryStore {
    async fn upsert_detail(&self, detail: &ApprovalDetail) -> Result<(), StoreError> {
        self.details.insert(detail.key.clone(), detail.clone());
        Ok(())
    }

    async fn upsert_summary(&self, summary: &ApprovalSummary) -> Result<(), StoreError> {
        self.summaries.insert(summary.key.clone(), summary.clone());
        Ok(())
    }

    async fn get_summary(&self, key: &SummaryKey) -> Result<Option<ApprovalSummary>, StoreError> {
        Ok(self.summaries.get(key).map(|s| s.clone()))
    }
}

#[async_trait]
impl TenantSource for MemoryStore {
    async fn load_tenants(&self) -> anyhow::Result<Vec<TenantInfo>> {
        Ok(self.tenants.read().await.clone())
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn record(&self, record: &AuditRecord) -> anyhow::Result<()> {
        self.audit.write().await.push(record.clone());
        Ok(())
    }
}
