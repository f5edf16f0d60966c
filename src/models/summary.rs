use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::arx::{ApprovalRequestExpression, Operation, TelemetryVector};
use super::tenant::TenantInfo;

/// Storage key of a request: `(tenant, document key, fiscal year)`.
///
/// `document_key` is the document number, or the display number for tenants
/// configured to key on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SummaryKey {
    pub tenant_id: String,
    pub document_key: String,
    pub fiscal_year: String,
}

impl SummaryKey {
    pub fn for_request(arx: &ApprovalRequestExpression, tenant: &TenantInfo) -> Self {
        let id = &arx.approval_identifier;
        let document_key = if tenant.routing.key_by_display_number {
            id.display_or_document_number()
        } else {
            id.document_number.as_str()
        };
        Self {
            tenant_id: arx.tenant_id().to_string(),
            document_key: document_key.trim().to_string(),
            fiscal_year: id.fiscal_year.trim().to_string(),
        }
    }
}

impl std::fmt::Display for SummaryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.document_key, self.fiscal_year)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStatus {
    Pending,
    Rejected,
    Deleted,
}

impl SummaryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryStatus::Pending => "pending",
            SummaryStatus::Rejected => "rejected",
            SummaryStatus::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(SummaryStatus::Pending),
            "rejected" => Some(SummaryStatus::Rejected),
            "deleted" => Some(SummaryStatus::Deleted),
            _ => None,
        }
    }
}

/// One row per request key. Upserted on every successful processing pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalSummary {
    pub key: SummaryKey,
    pub doc_type_id: Uuid,
    pub status: SummaryStatus,
    pub operation: Operation,
    pub approvers: Vec<String>,
    pub action_name: Option<String>,
    pub error_messages: Vec<String>,
    pub payload_id: Uuid,
    pub last_message_id: Uuid,
    pub telemetry: TelemetryVector,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalSummary {
    pub fn from_request(
        arx: &ApprovalRequestExpression,
        tenant: &TenantInfo,
        status: SummaryStatus,
        error_messages: Vec<String>,
        payload_id: Uuid,
        message_id: Uuid,
    ) -> Self {
        Self {
            key: SummaryKey::for_request(arx, tenant),
            doc_type_id: tenant.doc_type_id,
            status,
            operation: arx.operation,
            approvers: arx.approver_aliases().into_iter().map(String::from).collect(),
            action_name: arx.action_name().map(String::from),
            error_messages,
            payload_id,
            last_message_id: message_id,
            telemetry: arx.telemetry.clone(),
            updated_at: Utc::now(),
        }
    }
}

/// Full canonical request stored alongside its summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDetail {
    pub key: SummaryKey,
    pub request: ApprovalRequestExpression,
    pub updated_at: DateTime<Utc>,
}
