use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tenant onboarded to submit approval requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantInfo {
    pub tenant_id: String,
    /// Stable per tenant; carried on every message as the routing key.
    pub doc_type_id: Uuid,
    #[serde(default)]
    pub name: String,
    /// Key into the strategy registry selecting the payload converter.
    pub strategy_tag: String,
    /// Key into the strategy registry selecting tenant custom rules.
    #[serde(default = "default_validation_tag")]
    pub validation_tag: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    /// Overrides the pipeline-wide delivery attempt limit.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_validation_tag() -> String {
    "default".to_string()
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Invoke the notification trigger after a successful persist.
    #[serde(default = "default_true")]
    pub notify: bool,
    /// Key requests on `DisplayDocumentNumber` instead of `DocumentNumber`.
    #[serde(default)]
    pub key_by_display_number: bool,
    #[serde(default = "default_request_version")]
    pub approval_request_version: String,
    #[serde(default)]
    pub business_process_name: String,
}

fn default_true() -> bool {
    true
}

fn default_request_version() -> String {
    "1".to_string()
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            notify: true,
            key_by_display_number: false,
            approval_request_version: default_request_version(),
            business_process_name: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Resolve every approver alias against the identity service.
    #[serde(default)]
    pub validate_aliases: bool,
    #[serde(default)]
    pub require_approvers: bool,
    #[serde(default)]
    pub require_fiscal_year: bool,
    /// Lowercase extensions without the dot. Empty means any type is allowed.
    #[serde(default)]
    pub allowed_file_types: Vec<String>,
    #[serde(default)]
    pub max_attachments: Option<usize>,
    #[serde(default)]
    pub max_file_size_bytes: Option<u64>,
    /// Regex the keyed document number must match.
    #[serde(default)]
    pub document_number_pattern: Option<String>,
}
