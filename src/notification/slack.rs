use anyhow::Context;
use serde::Serialize;

use super::{Alerter, OperationalAlert};

#[derive(Clone)]
pub struct SlackAlerter {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackAlerter {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
        }
    }

    fn render(alert: &OperationalAlert) -> SlackMessage {
        SlackMessage {
            text: format!(
                "🚨 *Approval message dead-lettered* 🚨\n\nTenant: `{}`\nMessage ID: `{}`\nReason: {}\nAttempts: {}\nTcv: `{}`\nError:\n```{}```\n\nRun `approvald dead-letter replay {}` after fixing the cause.",
                alert.tenant_id,
                alert.message_id,
                alert.reason.as_str(),
                alert.attempt_count,
                alert.tcv,
                alert.error,
                alert.message_id,
            ),
        }
    }
}

#[async_trait::async_trait]
impl Alerter for SlackAlerter {
    async fn alert(&self, alert: &OperationalAlert) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&Self::render(alert))
            .send()
            .await
            .context("failed to send slack alert")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("slack returned error: status={}, body={}", status, body);
        }

        tracing::info!("Sent Slack alert for message {}", alert.message_id);
        Ok(())
    }
}

#[derive(Serialize)]
struct SlackMessage {
    text: String,
}
