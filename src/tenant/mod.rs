pub mod converters;
pub mod registry;
pub mod resolver;
pub mod rules;
pub mod strategy;

pub use registry::{normalize_tenant_id, TenantRegistry, TenantSnapshot};
pub use resolver::{ResolvedTenant, TenantStrategyResolver, TenantValidator};
pub use strategy::{CustomRules, StrategyRegistry, TenantStrategy};
