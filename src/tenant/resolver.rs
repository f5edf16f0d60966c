use std::sync::Arc;

use crate::errors::ResolutionError;
use crate::identity::IdentityError;
use crate::models::arx::ApprovalRequestExpression;
use crate::models::tenant::TenantInfo;
use crate::models::validation::ValidationCheckResult;
use crate::validation::ValidationEngine;

use super::registry::TenantRegistry;
use super::strategy::{CustomRules, StrategyRegistry, TenantStrategy};

/// Validator bound to one tenant's configuration and custom rules.
#[derive(Clone)]
pub struct TenantValidator {
    engine: Arc<ValidationEngine>,
    rules: Arc<dyn CustomRules>,
    tenant: Arc<TenantInfo>,
}

impl TenantValidator {
    pub async fn validate(
        &self,
        arx: &ApprovalRequestExpression,
    ) -> Result<ValidationCheckResult, IdentityError> {
        self.engine
            .validate(arx, &self.tenant, self.rules.as_ref())
            .await
    }
}

/// Everything needed to process one tenant's payloads.
#[derive(Clone)]
pub struct ResolvedTenant {
    pub tenant: Arc<TenantInfo>,
    pub converter: Arc<dyn TenantStrategy>,
    pub validator: TenantValidator,
}

/// Maps a tenant id to its converter and validator.
///
/// Does not look at `enabled`: intake rejects disabled tenants, while
/// messages already on the bus still drain.
#[derive(Clone)]
pub struct TenantStrategyResolver {
    registry: TenantRegistry,
    strategies: Arc<StrategyRegistry>,
    engine: Arc<ValidationEngine>,
}

impl TenantStrategyResolver {
    pub fn new(
        registry: TenantRegistry,
        strategies: Arc<StrategyRegistry>,
        engine: Arc<ValidationEngine>,
    ) -> Self {
        Self {
            registry,
            strategies,
            engine,
        }
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    pub async fn resolve(&self, tenant_id: &str) -> Result<ResolvedTenant, ResolutionError> {
        let snapshot = self.registry.snapshot().await;
        let tenant = snapshot
            .get(tenant_id)
            .ok_or_else(|| ResolutionError::UnknownTenant(tenant_id.to_string()))?;

        let converter = self.strategies.strategy(&tenant.strategy_tag).ok_or_else(|| {
            ResolutionError::UnknownStrategy {
                tenant_id: tenant.tenant_id.clone(),
                tag: tenant.strategy_tag.clone(),
            }
        })?;
        let rules = self.strategies.rules(&tenant.validation_tag).ok_or_else(|| {
            ResolutionError::UnknownValidation {
                tenant_id: tenant.tenant_id.clone(),
                tag: tenant.validation_tag.clone(),
            }
        })?;

        Ok(ResolvedTenant {
            validator: TenantValidator {
                engine: self.engine.clone(),
                rules,
                tenant: tenant.clone(),
            },
            tenant,
            converter,
        })
    }
}
