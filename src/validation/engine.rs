//! Rule evaluation for canonical requests.
//!
//! Families run in a fixed order (required fields, alias legitimacy,
//! attachment constraints, tenant custom rules) and every violation is
//! reported. The engine holds no per-request state.

use std::sync::Arc;

use futures::future::join_all;
use regex::Regex;

use crate::identity::{IdentityError, IdentityResolver};
use crate::models::arx::{ApprovalRequestExpression, Operation};
use crate::models::tenant::TenantInfo;
use crate::models::validation::ValidationCheckResult;
use crate::tenant::strategy::CustomRules;

/// Structural checks that need no network access. Also run by intake.
pub fn check_required_fields(arx: &ApprovalRequestExpression, tenant: &TenantInfo) -> Vec<String> {
    let mut errors = Vec::new();
    let id = &arx.approval_identifier;
    let config = &tenant.validation;

    if id.document_number.trim().is_empty() {
        errors.push("DocumentNumber is required".to_string());
    }
    if config.require_fiscal_year && id.fiscal_year.trim().is_empty() {
        errors.push("FiscalYear is required".to_string());
    }
    if config.require_approvers
        && arx.operation != Operation::Delete
        && arx.approver_aliases().is_empty()
    {
        errors.push("At least one approver is required".to_string());
    }

    if let Some(pattern) = config.document_number_pattern.as_deref() {
        let keyed = if tenant.routing.key_by_display_number {
            id.display_or_document_number()
        } else {
            id.document_number.as_str()
        };
        match Regex::new(pattern) {
            Ok(re) if !keyed.trim().is_empty() && !re.is_match(keyed.trim()) => {
                errors.push(format!(
                    "DocumentNumber '{}' does not match pattern '{}'",
                    keyed.trim(),
                    pattern
                ));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(tenant_id = %tenant.tenant_id, pattern, "invalid document number pattern: {}", e);
                errors.push(format!("DocumentNumber pattern '{}' is invalid", pattern));
            }
        }
    }

    errors
}

fn check_attachments(arx: &ApprovalRequestExpression, tenant: &TenantInfo) -> Vec<String> {
    let mut errors = Vec::new();
    let config = &tenant.validation;
    let attachments = arx.attachments();

    if !config.allowed_file_types.is_empty() {
        for attachment in attachments {
            match attachment.extension() {
                Some(ext)
                    if config
                        .allowed_file_types
                        .iter()
                        .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(&ext)) => {}
                Some(ext) => errors.push(format!(
                    "Attachment '{}' has disallowed file type '{}'",
                    attachment.name, ext
                )),
                None => errors.push(format!(
                    "Attachment '{}' has no file type",
                    attachment.name
                )),
            }
        }
    }

    if let Some(max) = config.max_attachments {
        if attachments.len() > max {
            errors.push(format!(
                "Attachment count {} exceeds the maximum of {}",
                attachments.len(),
                max
            ));
        }
    }

    if let Some(max) = config.max_file_size_bytes {
        for attachment in attachments.iter().filter(|a| a.file_size > max) {
            errors.push(format!(
                "Attachment '{}' is {} bytes, exceeding the maximum of {} bytes",
                attachment.name, attachment.file_size, max
            ));
        }
    }

    errors
}

pub struct ValidationEngine {
    identity: Arc<dyn IdentityResolver>,
}

impl ValidationEngine {
    pub fn new(identity: Arc<dyn IdentityResolver>) -> Self {
        Self { identity }
    }

    /// Run every rule family.
    ///
    /// Returns `Err` only when the identity service could not answer; the
    /// caller treats that as transient.
    pub async fn validate(
        &self,
        arx: &ApprovalRequestExpression,
        tenant: &TenantInfo,
        rules: &dyn CustomRules,
    ) -> Result<ValidationCheckResult, IdentityError> {
        let mut result = ValidationCheckResult::from_errors(check_required_fields(arx, tenant));
        result.extend(self.check_aliases(arx, tenant).await?);
        result.extend(check_attachments(arx, tenant));
        result.extend(rules.check(arx, tenant));

        if !result.action_result {
            tracing::debug!(
                tenant_id = %tenant.tenant_id,
                violations = result.error_messages.len(),
                "request failed validation"
            );
        }
        Ok(result)
    }

    async fn check_aliases(
        &self,
        arx: &ApprovalRequestExpression,
        tenant: &TenantInfo,
    ) -> Result<Vec<String>, IdentityError> {
        if !tenant.validation.validate_aliases || arx.operation == Operation::Delete {
            return Ok(Vec::new());
        }

        let aliases = arx.approver_aliases();
        let lookups = join_all(aliases.iter().map(|alias| self.identity.resolve_alias(alias))).await;

        let mut errors = Vec::new();
        for (alias, found) in aliases.into_iter().zip(lookups) {
            if !found? {
                errors.push(format!("Approver alias '{}' could not be resolved", alias));
            }
        }
        Ok(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PermissiveIdentityResolver;
    use crate::models::arx::{ActionDetail, ApprovalIdentifier, Approver, Attachment};
    use crate::models::tenant::ValidationConfig;
    use crate::tenant::rules::{DefaultRules, FinancialRules};
    use async_trait::async_trait;

    struct Directory(&'static [&'static str]);

    #[async_trait]
    impl IdentityResolver for Directory {
        async fn resolve_alias(&self, alias: &str) -> Result<bool, IdentityError> {
            Ok(self.0.contains(&alias))
        }
    }

    struct Down;

    #[async_trait]
    impl IdentityResolver for Down {
        async fn resolve_alias(&self, _alias: &str) -> Result<bool, IdentityError> {
            Err(IdentityError::Status(503))
        }
    }

    fn tenant(validation: ValidationConfig) -> TenantInfo {
        TenantInfo {
            tenant_id: "t1".into(),
            doc_type_id: uuid::Uuid::new_v4(),
            name: String::new(),
            strategy_tag: "standard".into(),
            validation_tag: "default".into(),
            enabled: true,
            routing: Default::default(),
            validation,
            max_attempts: None,
        }
    }

    fn request(aliases: &[&str], attachments: Vec<Attachment>) -> ApprovalRequestExpression {
        let mut arx = ApprovalRequestExpression::new(
            "t1",
            ApprovalIdentifier::new("PO1", "2024"),
            Operation::Create,
        );
        arx.approvers = aliases
            .iter()
            .map(|a| Approver { alias: a.to_string(), name: None })
            .collect();
        arx.action_detail = Some(ActionDetail {
            name: "Approve".into(),
            attachments,
            ..Default::default()
        });
        arx
    }

    fn attachment(name: &str, size: u64) -> Attachment {
        Attachment { name: name.into(), url: None, file_size: size }
    }

    #[tokio::test]
    async fn test_two_attachment_violations_both_reported() {
        let engine = ValidationEngine::new(Arc::new(PermissiveIdentityResolver));
        let t = tenant(ValidationConfig {
            allowed_file_types: vec!["pdf".into()],
            max_attachments: Some(1),
            ..Default::default()
        });
        let arx = request(&[], vec![attachment("a.pdf", 1), attachment("b.exe", 1)]);

        let result = engine.validate(&arx, &t, &DefaultRules).await.unwrap();
        assert!(!result.action_result);
        assert_eq!(result.error_messages.len(), 2);
        assert!(result.error_messages[0].contains("disallowed file type 'exe'"));
        assert!(result.error_messages[1].contains("count 2 exceeds the maximum of 1"));
    }

    #[tokio::test]
    async fn test_families_reported_in_declaration_order() {
        let engine = ValidationEngine::new(Arc::new(Directory(&["alice"])));
        let mut t = tenant(ValidationConfig {
            validate_aliases: true,
            max_file_size_bytes: Some(10),
            ..Default::default()
        });
        t.validation_tag = "financial".into();
        let mut arx = request(&["alice", "mallory"], vec![attachment("big.pdf", 11)]);
        arx.approval_identifier.document_number = " ".into();

        let result = engine.validate(&arx, &t, &FinancialRules).await.unwrap();
        let errors = &result.error_messages;
        assert_eq!(errors.len(), 4, "{:?}", errors);
        assert_eq!(errors[0], "DocumentNumber is required");
        assert_eq!(errors[1], "Approver alias 'mallory' could not be resolved");
        assert!(errors[2].starts_with("Attachment 'big.pdf' is 11 bytes"));
        assert_eq!(errors[3], "Amount is required");
    }

    #[tokio::test]
    async fn test_alias_checks_skipped_for_delete() {
        let engine = ValidationEngine::new(Arc::new(Down));
        let t = tenant(ValidationConfig {
            validate_aliases: true,
            ..Default::default()
        });
        let mut arx = request(&["alice"], Vec::new());
        arx.operation = Operation::Delete;

        let result = engine.validate(&arx, &t, &DefaultRules).await.unwrap();
        assert!(result.action_result);
    }

    #[tokio::test]
    async fn test_identity_outage_is_an_error_not_a_rejection() {
        let engine = ValidationEngine::new(Arc::new(Down));
        let t = tenant(ValidationConfig {
            validate_aliases: true,
            ..Default::default()
        });
        let arx = request(&["alice"], Vec::new());
        assert!(engine.validate(&arx, &t, &DefaultRules).await.is_err());
    }

    #[test]
    fn test_required_fields_and_pattern() {
        let t = tenant(ValidationConfig {
            require_approvers: true,
            require_fiscal_year: true,
            document_number_pattern: Some("^PO[0-9]+$".into()),
            ..Default::default()
        });
        let mut arx = request(&[], Vec::new());
        arx.approval_identifier.fiscal_year.clear();
        arx.approval_identifier.document_number = "INV9".into();

        let errors = check_required_fields(&arx, &t);
        assert_eq!(
            errors,
            vec![
                "FiscalYear is required",
                "At least one approver is required",
                "DocumentNumber 'INV9' does not match pattern '^PO[0-9]+$'",
            ]
        );
    }

    #[test]
    fn test_invalid_pattern_is_reported() {
        let t = tenant(ValidationConfig {
            document_number_pattern: Some("(".into()),
            ..Default::default()
        });
        let errors = check_required_fields(&request(&[], Vec::new()), &t);
        assert_eq!(errors, vec!["DocumentNumber pattern '(' is invalid"]);
    }
}
