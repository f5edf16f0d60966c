use std::time::Duration;

use anyhow::Result;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{info, warn};

use super::{Alerter, OperationalAlert};
use crate::pipeline::retry::{with_backoff, RetryPolicy};

// ── HMAC Signing ─────────────────────────────────────────────

/// HMAC-SHA256 of `payload`, formatted as `sha256=<hex>`.
fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid webhook secret: {}", e))?;
    mac.update(payload);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

// ── Webhook Alerter ──────────────────────────────────────────

/// Posts alerts to generic webhook endpoints.
///
/// When a secret is configured the body is signed and the signature sent in
/// `x-pipeline-signature`. Each URL is retried independently.
#[derive(Clone)]
pub struct WebhookAlerter {
    client: reqwest::Client,
    urls: Vec<String>,
    signing_secret: Option<String>,
    policy: RetryPolicy,
}

impl WebhookAlerter {
    pub fn new(urls: Vec<String>, signing_secret: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("approval-pipeline-alerts/1.0")
            .build()?;
        Ok(Self {
            client,
            urls,
            signing_secret,
            policy: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 500,
                max_delay_ms: 5_000,
                jitter_ms: 0,
            },
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn send_once(&self, url: &str, payload: &[u8], delivery_id: &str, signature: Option<&str>) -> Result<()> {
        let mut req = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .header("x-pipeline-delivery-id", delivery_id)
            .header("x-pipeline-timestamp", chrono::Utc::now().timestamp().to_string())
            .header("x-pipeline-event", "message_dead_lettered");

        if let Some(sig) = signature {
            req = req.header("x-pipeline-signature", sig);
        }

        let resp = req.body(payload.to_vec()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("webhook returned {}: {}", status, body);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Alerter for WebhookAlerter {
    async fn alert(&self, alert: &OperationalAlert) -> Result<()> {
        let payload = serde_json::to_vec(alert)?;
        let signature = self
            .signing_secret
            .as_deref()
            .map(|s| hmac_sha256_hex(s, &payload))
            .transpose()?;
        let delivery_id = uuid::Uuid::new_v4().to_string();

        let mut failed = Vec::new();
        for url in &self.urls {
            let sent = with_backoff(&self.policy, "alert webhook", || {
                self.send_once(url, &payload, &delivery_id, signature.as_deref())
            })
            .await;
            match sent {
                Ok(()) => info!(url, delivery_id = %delivery_id, "alert webhook delivered"),
                Err(exhausted) => {
                    warn!(url, attempts = exhausted.attempts, error = %exhausted.last_error, "alert webhook failed");
                    failed.push(url.as_str());
                }
            }
        }

        if !failed.is_empty() {
            anyhow::bail!("alert webhook delivery failed for {}", failed.join(", "));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::DeadLetterReason;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn alert() -> OperationalAlert {
        OperationalAlert::dead_lettered(
            DeadLetterReason::TenantResolution,
            "ghost-tenant",
            uuid::Uuid::new_v4(),
            0,
            "unknown tenant 'ghost-tenant'",
            "tcv-1",
        )
    }

    #[test]
    fn test_hmac_signature_deterministic() {
        let sig1 = hmac_sha256_hex("secret123", b"payload").unwrap();
        let sig2 = hmac_sha256_hex("secret123", b"payload").unwrap();
        assert_eq!(sig1, sig2);
        assert!(sig1.starts_with("sha256="));
        assert_ne!(sig1, hmac_sha256_hex("secret2", b"payload").unwrap());
    }

    #[tokio::test]
    async fn test_signed_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header_exists("x-pipeline-signature"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let alerter = WebhookAlerter::new(vec![format!("{}/hook", server.uri())], Some("s3cret".into()))
            .unwrap()
            .with_policy(RetryPolicy::immediate(3));
        alerter.alert(&alert()).await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_endpoint_is_retried_then_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&server)
            .await;

        let alerter = WebhookAlerter::new(vec![server.uri()], None)
            .unwrap()
            .with_policy(RetryPolicy::immediate(3));
        assert!(alerter.alert(&alert()).await.is_err());
    }
}
