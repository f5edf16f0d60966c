//! Identity resolution: does an approver alias name a real person?

pub mod cache;
pub mod http;

use async_trait::async_trait;
use thiserror::Error;

pub use cache::CachedIdentityResolver;
pub use http::HttpIdentityResolver;

/// The identity service could not answer. Always transient from the
/// pipeline's point of view.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity request failed: {0}")]
    Request(String),

    #[error("identity service returned status {0}")]
    Status(u16),
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_alias(&self, alias: &str) -> Result<bool, IdentityError>;
}

/// Accepts every alias. Used when no identity service is configured.
pub struct PermissiveIdentityResolver;

#[async_trait]
impl IdentityResolver for PermissiveIdentityResolver {
    async fn resolve_alias(&self, _alias: &str) -> Result<bool, IdentityError> {
        Ok(true)
    }
}
