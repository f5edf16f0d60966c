//! Strategy registry.
//!
//! Tenants name their converter and custom rule set by tag. Every tag maps to
//! a pre-built object assembled once at startup; there is no lookup by type
//! name at runtime.

use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::ConversionError;
use crate::models::arx::ApprovalRequestExpression;
use crate::models::tenant::TenantInfo;

use super::converters::{FlatStrategy, StandardStrategy};
use super::rules::{DefaultRules, FinancialRules};

/// Turns a tenant's raw payload into the canonical request.
///
/// Implementations must be deterministic: the same bytes always produce an
/// equal request.
pub trait TenantStrategy: Send + Sync {
    fn tag(&self) -> &'static str;

    /// Value published as the `ContentType` application property.
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn convert(
        &self,
        tenant: &TenantInfo,
        raw: &[u8],
    ) -> Result<ApprovalRequestExpression, ConversionError>;
}

/// Tenant-declared business rules run after the built-in rule families.
///
/// Must not keep state between calls.
pub trait CustomRules: Send + Sync {
    fn tag(&self) -> &'static str;

    /// Every violation, in declaration order.
    fn check(&self, arx: &ApprovalRequestExpression, tenant: &TenantInfo) -> Vec<String>;
}

#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn TenantStrategy>>,
    rules: HashMap<String, Arc<dyn CustomRules>>,
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in converter and rule set.
    pub fn builtin() -> Self {
        Self::empty()
            .with_strategy(Arc::new(StandardStrategy))
            .with_strategy(Arc::new(FlatStrategy))
            .with_rules(Arc::new(DefaultRules))
            .with_rules(Arc::new(FinancialRules))
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn TenantStrategy>) -> Self {
        self.strategies.insert(strategy.tag().to_string(), strategy);
        self
    }

    pub fn with_rules(mut self, rules: Arc<dyn CustomRules>) -> Self {
        self.rules.insert(rules.tag().to_string(), rules);
        self
    }

    pub fn strategy(&self, tag: &str) -> Option<Arc<dyn TenantStrategy>> {
        self.strategies.get(tag).cloned()
    }

    pub fn rules(&self, tag: &str) -> Option<Arc<dyn CustomRules>> {
        self.rules.get(tag).cloned()
    }

    /// Describe every tenant whose tags have no registered implementation.
    pub fn unresolved_tags(&self, tenants: &[Arc<TenantInfo>]) -> Vec<String> {
        let mut problems = Vec::new();
        for tenant in tenants {
            if !self.strategies.contains_key(&tenant.strategy_tag) {
                problems.push(format!(
                    "tenant '{}': unknown strategy tag '{}'",
                    tenant.tenant_id, tenant.strategy_tag
                ));
            }
            if !self.rules.contains_key(&tenant.validation_tag) {
                problems.push(format!(
                    "tenant '{}': unknown validation tag '{}'",
                    tenant.tenant_id, tenant.validation_tag
                ));
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_has_all_tags() {
        let registry = StrategyRegistry::builtin();
        assert!(registry.strategy("standard").is_some());
        assert!(registry.strategy("flat").is_some());
        assert!(registry.rules("default").is_some());
        assert!(registry.rules("financial").is_some());
        assert!(registry.strategy("com.contoso.ReflectedType").is_none());
    }

    #[test]
    fn test_unresolved_tags_reported() {
        let registry = StrategyRegistry::builtin();
        let tenant = TenantInfo {
            tenant_id: "t1".into(),
            doc_type_id: uuid::Uuid::new_v4(),
            name: String::new(),
            strategy_tag: "xml".into(),
            validation_tag: "strict".into(),
            enabled: true,
            routing: Default::default(),
            validation: Default::default(),
            max_attempts: None,
        };
        let problems = registry.unresolved_tags(&[Arc::new(tenant)]);
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("'xml'"));
        assert!(problems[1].contains("'strict'"));
    }
}
