//! Audit sink seam. The concrete audit store lives outside this crate's
//! core; Postgres and in-memory sinks are provided.

use async_trait::async_trait;

use crate::models::audit::AuditRecord;

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> anyhow::Result<()>;
}
