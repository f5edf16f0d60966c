use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};

use super::{IdentityError, IdentityResolver};

/// Looks aliases up with `GET {base}/aliases/{alias}`: 200 means the alias
/// exists, 404 means it does not. Transient failures are retried by the
/// client middleware before surfacing as errors.
pub struct HttpIdentityResolver {
    client: ClientWithMiddleware,
    base_url: String,
}

impl HttpIdentityResolver {
    pub fn new(base_url: &str, timeout: Duration, max_retries: u32) -> anyhow::Result<Self> {
        let inner = reqwest::Client::builder().timeout(timeout).build()?;
        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_millis(50), Duration::from_secs(5))
            .build_with_max_retries(max_retries);
        let client = ClientBuilder::new(inner)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl IdentityResolver for HttpIdentityResolver {
    async fn resolve_alias(&self, alias: &str) -> Result<bool, IdentityError> {
        let url = format!(
            "{}/aliases/{}",
            self.base_url,
            urlencoding::encode(alias.trim())
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| IdentityError::Request(e.to_string()))?;

        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => {
                tracing::warn!(alias, status = s.as_u16(), "identity lookup failed");
                Err(IdentityError::Status(s.as_u16()))
            }
        }
    }
}
