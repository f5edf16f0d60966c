//! Persistence seams for summaries, details and the tenant catalog.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::summary::{ApprovalDetail, ApprovalSummary, SummaryKey};
use crate::models::tenant::TenantInfo;

pub mod memory;
pub mod payload_store;
pub mod postgres;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The row itself is unacceptable (value too long, bad encoding).
    #[error("store rejected the data: {0}")]
    Rejected(String),
}

impl StoreError {
    /// True when writing the same data again cannot succeed.
    ///
    /// Postgres reports these as SQLSTATE class 22 (data exception) or 54
    /// (program limit exceeded, e.g. an oversized index row).
    pub fn is_permanent(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::Database(db)) => db
                .code()
                .map(|code| code.starts_with("22") || code.starts_with("54"))
                .unwrap_or(false),
            StoreError::Serialization(_) | StoreError::Rejected(_) => true,
            StoreError::Database(_) | StoreError::Unavailable(_) => false,
        }
    }
}

/// Upsert-by-key storage for processed requests.
///
/// Both writes are insert-if-absent, else overwrite, so replaying the same
/// message leaves exactly one row per key.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn upsert_detail(&self, detail: &ApprovalDetail) -> Result<(), StoreError>;

    async fn upsert_summary(&self, summary: &ApprovalSummary) -> Result<(), StoreError>;

    async fn get_summary(&self, key: &SummaryKey) -> Result<Option<ApprovalSummary>, StoreError>;
}

/// Where the tenant registry loads its catalog from.
#[async_trait]
pub trait TenantSource: Send + Sync {
    async fn load_tenants(&self) -> anyhow::Result<Vec<TenantInfo>>;
}

/// Tenant catalog kept in a YAML file.
pub struct YamlTenantSource {
    path: std::path::PathBuf,
}

impl YamlTenantSource {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[derive(serde::Deserialize)]
struct TenantFile {
    tenants: Vec<TenantInfo>,
}

#[async_trait]
impl TenantSource for YamlTenantSource {
    async fn load_tenants(&self) -> anyhow::Result<Vec<TenantInfo>> {
        use anyhow::Context;

        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read tenants file {}", self.path.display()))?;
        let file: TenantFile = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse tenants file {}", self.path.display()))?;
        Ok(file.tenants)
    }
}
