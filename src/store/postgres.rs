use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::{ApprovalStore, StoreError, TenantSource};
use crate::audit::AuditSink;
use crate::models::arx::{Operation, TelemetryVector};
use crate::models::audit::AuditRecord;
use crate::models::summary::{ApprovalDetail, ApprovalSummary, SummaryKey, SummaryStatus};
use crate::models::tenant::{RoutingConfig, TenantInfo, ValidationConfig};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // -- Tenant Operations --

    pub async fn upsert_tenant(&self, tenant: &TenantInfo) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO tenants (tenant_id, doc_type_id, name, strategy_tag, validation_tag, enabled, routing, validation, max_attempts)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               ON CONFLICT (tenant_id) DO UPDATE
                   SET name           = EXCLUDED.name,
                       strategy_tag   = EXCLUDED.strategy_tag,
                       validation_tag = EXCLUDED.validation_tag,
                       enabled        = EXCLUDED.enabled,
                       routing        = EXCLUDED.routing,
                       validation     = EXCLUDED.validation,
                       max_attempts   = EXCLUDED.max_attempts,
                       updated_at     = NOW()"#,
        )
        .bind(&tenant.tenant_id)
        .bind(tenant.doc_type_id)
        .bind(&tenant.name)
        .bind(&tenant.strategy_tag)
        .bind(&tenant.validation_tag)
        .bind(tenant.enabled)
        .bind(Json(&tenant.routing))
        .bind(Json(&tenant.validation))
        .bind(tenant.max_attempts.map(|m| m as i32))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct TenantRow {
    tenant_id: String,
    doc_type_id: Uuid,
    name: String,
    strategy_tag: String,
    validation_tag: String,
    enabled: bool,
    routing: Json<RoutingConfig>,
    validation: Json<ValidationConfig>,
    max_attempts: Option<i32>,
}

impl From<TenantRow> for TenantInfo {
    fn from(row: TenantRow) -> Self {
        TenantInfo {
            tenant_id: row.tenant_id,
            doc_type_id: row.doc_type_id,
            name: row.name,
            strategy_tag: row.strategy_tag,
            validation_tag: row.validation_tag,
            enabled: row.enabled,
            routing: row.routing.0,
            validation: row.validation.0,
            max_attempts: row.max_attempts.map(|m| m.max(0) as u32),
        }
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    tenant_id: String,
    document_key: String,
    fiscal_year: String,
    doc_type_id: Uuid,
    status: String,
    operation: String,
    approvers: Json<Vec<String>>,
    action_name: Option<String>,
    error_messages: Json<Vec<String>>,
    payload_id: Uuid,
    last_message_id: Uuid,
    telemetry: Json<TelemetryVector>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SummaryRow> for ApprovalSummary {
    type Error = StoreError;

    fn try_from(row: SummaryRow) -> Result<Self, Self::Error> {
        let status = SummaryStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Unavailable(format!("unknown summary status '{}'", row.status)))?;
        let operation = Operation::parse(&row.operation)
            .ok_or_else(|| StoreError::Unavailable(format!("unknown operation '{}'", row.operation)))?;
        Ok(ApprovalSummary {
            key: SummaryKey {
                tenant_id: row.tenant_id,
                document_key: row.document_key,
                fiscal_year: row.fiscal_year,
            },
            doc_type_id: row.doc_type_id,
            status,
            operation,
            approvers: row.approvers.0,
            action_name: row.action_name,
            error_messages: row.error_messages.0,
            payload_id: row.payload_id,
            last_message_id: row.last_message_id,
            telemetry: row.telemetry.0,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl ApprovalStore for PgStore {
    async fn upsert_detail(&self, detail: &ApprovalDetail) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO approval_details (tenant_id, document_key, fiscal_year, request, updated_at)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (tenant_id, document_key, fiscal_year) DO UPDATE
                   SET request    = EXCLUDED.request,
                       updated_at = EXCLUDED.updated_at"#,
        )
        .bind(&detail.key.tenant_id)
        .bind(&detail.key.document_key)
        .bind(&detail.key.fiscal_year)
        .bind(Json(&detail.request))
        .bind(detail.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_summary(&self, summary: &ApprovalSummary) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO approval_summaries (
                   tenant_id, document_key, fiscal_year, doc_type_id, status, operation,
                   approvers, action_name, error_messages, payload_id, last_message_id,
                   telemetry, updated_at
               )
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
               ON CONFLICT (tenant_id, document_key, fiscal_year) DO UPDATE
                   SET doc_type_id     = EXCLUDED.doc_type_id,
                       status          = EXCLUDED.status,
                       operation       = EXCLUDED.operation,
                       approvers       = EXCLUDED.approvers,
                       action_name     = EXCLUDED.action_name,
                       error_messages  = EXCLUDED.error_messages,
                       payload_id      = EXCLUDED.payload_id,
                       last_message_id = EXCLUDED.last_message_id,
                       telemetry       = EXCLUDED.telemetry,
                       updated_at      = EXCLUDED.updated_at"#,
        )
        .bind(&summary.key.tenant_id)
        .bind(&summary.key.document_key)
        .bind(&summary.key.fiscal_year)
        .bind(summary.doc_type_id)
        .bind(summary.status.as_str())
        .bind(summary.operation.as_str())
        .bind(Json(&summary.approvers))
        .bind(&summary.action_name)
        .bind(Json(&summary.error_messages))
        .bind(summary.payload_id)
        .bind(summary.last_message_id)
        .bind(Json(&summary.telemetry))
        .bind(summary.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_summary(&self, key: &SummaryKey) -> Result<Option<ApprovalSummary>, StoreError> {
        let row = sqlx::query_as::<_, SummaryRow>(
            r#"SELECT tenant_id, document_key, fiscal_year, doc_type_id, status, operation,
                      approvers, action_name, error_messages, payload_id, last_message_id,
                      telemetry, updated_at
               FROM approval_summaries
               WHERE tenant_id = $1 AND document_key = $2 AND fiscal_year = $3"#,
        )
        .bind(&key.tenant_id)
        .bind(&key.document_key)
        .bind(&key.fiscal_year)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ApprovalSummary::try_from).transpose()
    }
}

#[async_trait]
impl TenantSource for PgStore {
    async fn load_tenants(&self) -> anyhow::Result<Vec<TenantInfo>> {
        let rows = sqlx::query_as::<_, TenantRow>(
            r#"SELECT tenant_id, doc_type_id, name, strategy_tag, validation_tag, enabled,
                      routing, validation, max_attempts
               FROM tenants
               ORDER BY tenant_id ASC"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(TenantInfo::from).collect())
    }
}

#[async_trait]
impl AuditSink for PgStore {
    async fn record(&self, entry: &AuditRecord) -> anyhow::Result<()> {
        let key = entry.key.as_ref();
        sqlx::query(
            r#"
            INSERT INTO pipeline_audit (
                id, message_id, payload_id, tenant_id, document_key, fiscal_year,
                stage, outcome, attempt_count, xcv, tcv, failure, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.message_id)
        .bind(entry.payload_id)
        .bind(&entry.tenant_id)
        .bind(key.map(|k| k.document_key.as_str()))
        .bind(key.map(|k| k.fiscal_year.as_str()))
        .bind(entry.stage.as_str())
        .bind(entry.outcome.as_str())
        .bind(entry.attempt_count as i32)
        .bind(entry.telemetry.as_ref().map(|t| t.xcv.as_str()))
        .bind(entry.telemetry.as_ref().map(|t| t.tcv.as_str()))
        .bind(&entry.failure)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
