//! Canonical, tenant-neutral approval request (ARX).
//!
//! Every tenant converter produces one of these. The wire casing is
//! PascalCase to match what tenants submit.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Operation carried by a request. Closed set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[default]
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "Create",
            Operation::Update => "Update",
            Operation::Delete => "Delete",
        }
    }

    /// Parse a tenant-supplied operation name, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite key of a request within a tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApprovalIdentifier {
    #[serde(default)]
    pub document_number: String,
    #[serde(default)]
    pub display_document_number: String,
    #[serde(default)]
    pub fiscal_year: String,
}

impl ApprovalIdentifier {
    pub fn new(document_number: impl Into<String>, fiscal_year: impl Into<String>) -> Self {
        Self {
            document_number: document_number.into(),
            display_document_number: String::new(),
            fiscal_year: fiscal_year.into(),
        }
    }

    /// The display number falls back to the document number when the tenant
    /// did not send one.
    pub fn display_or_document_number(&self) -> &str {
        if self.display_document_number.is_empty() {
            &self.document_number
        } else {
            &self.display_document_number
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Approver {
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Attachment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub file_size: u64,
}

impl Attachment {
    /// Lowercased extension without the dot, if any.
    pub fn extension(&self) -> Option<String> {
        let (stem, ext) = self.name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActionDetail {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NotificationDetail {
    #[serde(default = "default_send_notification")]
    pub send_notification: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_key: Option<String>,
}

fn default_send_notification() -> bool {
    true
}

impl Default for NotificationDetail {
    fn default() -> Self {
        Self {
            send_notification: true,
            to: Vec::new(),
            template_key: None,
        }
    }
}

/// Correlation identifiers. Filled in at intake and then carried unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TelemetryVector {
    #[serde(default)]
    pub xcv: String,
    #[serde(default)]
    pub tcv: String,
    #[serde(default)]
    pub business_process_name: String,
}

impl TelemetryVector {
    /// Complete a possibly partial vector. `tcv_override` wins over whatever
    /// the payload carried; missing ids are generated.
    pub fn completed(mut self, tcv_override: Option<&str>, default_process: &str) -> Self {
        if let Some(tcv) = tcv_override.map(str::trim).filter(|t| !t.is_empty()) {
            self.tcv = tcv.to_string();
        }
        if self.tcv.is_empty() {
            self.tcv = uuid::Uuid::new_v4().to_string();
        }
        if self.xcv.is_empty() {
            self.xcv = uuid::Uuid::new_v4().to_string();
        }
        if self.business_process_name.is_empty() {
            self.business_process_name = default_process.to_string();
        }
        self
    }
}

/// Canonical approval request.
///
/// The tenant id is fixed at construction; there is no setter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApprovalRequestExpression {
    tenant_id: String,
    pub approval_identifier: ApprovalIdentifier,
    pub operation: Operation,
    #[serde(default)]
    pub approvers: Vec<Approver>,
    #[serde(default)]
    pub action_detail: Option<ActionDetail>,
    #[serde(default)]
    pub notification_detail: Option<NotificationDetail>,
    #[serde(default)]
    pub additional_data: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub telemetry: TelemetryVector,
}

impl ApprovalRequestExpression {
    pub fn new(
        tenant_id: impl Into<String>,
        approval_identifier: ApprovalIdentifier,
        operation: Operation,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            approval_identifier,
            operation,
            approvers: Vec::new(),
            action_detail: None,
            notification_detail: None,
            additional_data: BTreeMap::new(),
            telemetry: TelemetryVector::default(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn attachments(&self) -> &[Attachment] {
        self.action_detail
            .as_ref()
            .map(|a| a.attachments.as_slice())
            .unwrap_or(&[])
    }

    pub fn action_name(&self) -> Option<&str> {
        self.action_detail
            .as_ref()
            .map(|a| a.name.as_str())
            .filter(|n| !n.is_empty())
    }

    /// Aliases in submission order, duplicates removed.
    pub fn approver_aliases(&self) -> Vec<&str> {
        let mut seen = Vec::with_capacity(self.approvers.len());
        for approver in &self.approvers {
            let alias = approver.alias.trim();
            if !alias.is_empty() && !seen.contains(&alias) {
                seen.push(alias);
            }
        }
        seen
    }

    pub fn wants_notification(&self) -> bool {
        self.notification_detail
            .as_ref()
            .map(|n| n.send_notification)
            .unwrap_or(true)
    }
}
