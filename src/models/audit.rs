use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::arx::TelemetryVector;
use super::summary::SummaryKey;

/// Stage a message had reached when its outcome was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Received,
    Converting,
    Validating,
    Persisting,
    Succeeded,
    Retrying,
    DeadLettered,
}

impl ProcessingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStage::Received => "received",
            ProcessingStage::Converting => "converting",
            ProcessingStage::Validating => "validating",
            ProcessingStage::Persisting => "persisting",
            ProcessingStage::Succeeded => "succeeded",
            ProcessingStage::Retrying => "retrying",
            ProcessingStage::DeadLettered => "dead_lettered",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Succeeded,
    /// Persisted, but a downstream trigger failed.
    DegradedSuccess,
    /// Validation failed; stored as a rejected summary.
    Rejected,
    DeadLettered,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Succeeded => "succeeded",
            AuditOutcome::DegradedSuccess => "degraded_success",
            AuditOutcome::Rejected => "rejected",
            AuditOutcome::DeadLettered => "dead_lettered",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub message_id: Uuid,
    pub payload_id: Option<Uuid>,
    pub tenant_id: String,
    pub key: Option<SummaryKey>,
    pub stage: ProcessingStage,
    pub outcome: AuditOutcome,
    pub attempt_count: u32,
    pub telemetry: Option<TelemetryVector>,
    /// Error text and any collected validation messages.
    pub failure: Option<String>,
    pub recorded_at: DateTime<Utc>,
}
