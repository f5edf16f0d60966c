//! Bus envelope and the bodies carried on each topic.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use super::arx::TelemetryVector;
use super::summary::SummaryKey;

/// Destinations on the message bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// New work published by intake.
    Main,
    /// Delayed re-delivery of failed work.
    Retry,
    /// Terminal failures awaiting manual reprocessing.
    DeadLetter,
    /// Outbound notification triggers.
    Notification,
}

impl Topic {
    pub fn name(&self) -> &'static str {
        match self {
            Topic::Main => "approvals-main",
            Topic::Retry => "approvals-retry",
            Topic::DeadLetter => "approvals-deadletter",
            Topic::Notification => "approvals-notification",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApplicationProperties {
    pub application_id: String,
    pub approval_request_version: String,
    pub created_date: DateTime<Utc>,
    pub content_type: String,
}

/// A message as published on any topic. `message_id` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BusMessage {
    pub message_id: Uuid,
    pub correlation_id: String,
    pub application_properties: ApplicationProperties,
    pub body: serde_json::Value,
}

impl BusMessage {
    pub fn new<T: Serialize>(
        application_properties: ApplicationProperties,
        correlation_id: impl Into<String>,
        body: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id: Uuid::new_v4(),
            correlation_id: correlation_id.into(),
            application_properties,
            body: serde_json::to_value(body)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.body.clone())
    }
}

/// Body of a main-topic message: where the raw payload lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadPointer {
    pub payload_id: Uuid,
    pub tenant_id: String,
    pub doc_type_id: Uuid,
    pub telemetry: TelemetryVector,
    pub received_at: DateTime<Utc>,
}

/// Body of a retry-topic message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryEnvelope {
    pub original_message_id: Uuid,
    pub tenant_id: String,
    /// Never reset; grows by one on every re-enqueue.
    pub attempt_count: u32,
    pub payload_pointer: PayloadPointer,
    #[serde(default)]
    pub last_error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    TenantResolution,
    Conversion,
    RetryExhausted,
    Undecodable,
    /// The store rejected the data itself; retrying cannot succeed.
    Persistence,
    /// Redelivered more often than the worker allows without settling.
    DeliveryLimit,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::TenantResolution => "tenant_resolution",
            DeadLetterReason::Conversion => "conversion",
            DeadLetterReason::RetryExhausted => "retry_exhausted",
            DeadLetterReason::Undecodable => "undecodable",
            DeadLetterReason::Persistence => "persistence",
            DeadLetterReason::DeliveryLimit => "delivery_limit",
        }
    }
}

/// Body of a dead-letter message. Holds enough to replay the original work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub original_message_id: Uuid,
    pub tenant_id: String,
    pub attempt_count: u32,
    pub reason: DeadLetterReason,
    pub error: String,
    #[serde(default)]
    pub payload_pointer: Option<PayloadPointer>,
    #[serde(default)]
    pub original_body: Option<serde_json::Value>,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Body of a notification-topic message. References the persisted request
/// by key; the request itself is never copied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub key: SummaryKey,
    pub doc_type_id: Uuid,
    pub operation: super::arx::Operation,
    pub action_name: Option<String>,
    pub telemetry: TelemetryVector,
}

/// Synchronous answer to an intake call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PayloadProcessingResult {
    /// Absent when the payload was rejected by intake-time validation.
    pub payload_id: Option<Uuid>,
    pub validation_results: Option<super::validation::ValidationCheckResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> ApplicationProperties {
        ApplicationProperties {
            application_id: "tenant-a".into(),
            approval_request_version: "1".into(),
            created_date: Utc::now(),
            content_type: "application/json".into(),
        }
    }

    #[test]
    fn test_new_messages_get_distinct_ids() {
        let a = BusMessage::new(props(), "tcv", &serde_json::json!({})).unwrap();
        let b = BusMessage::new(props(), "tcv", &serde_json::json!({})).unwrap();
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn test_application_properties_wire_names() {
        let json = serde_json::to_value(props()).unwrap();
        assert_eq!(json["ApplicationId"], "tenant-a");
        assert!(json.get("ApprovalRequestVersion").is_some());
        assert!(json.get("CreatedDate").is_some());
        assert!(json.get("ContentType").is_some());
    }

    #[test]
    fn test_decode_wrong_body_fails() {
        let msg = BusMessage::new(props(), "tcv", &serde_json::json!({"unexpected": 1})).unwrap();
        assert!(msg.decode::<PayloadPointer>().is_err());
    }
}
