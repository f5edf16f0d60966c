//! Downstream triggers: the notification topic and operational alerts.
//!
//! Formatting and delivery of end-user notifications happens elsewhere; the
//! pipeline only publishes a reference to the persisted request.

pub mod slack;
pub mod webhook;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::models::message::{
    ApplicationProperties, BusMessage, DeadLetterReason, NotificationMessage, Topic,
};

pub use slack::SlackAlerter;
pub use webhook::WebhookAlerter;

#[async_trait]
pub trait NotificationTrigger: Send + Sync {
    async fn trigger(
        &self,
        notification: &NotificationMessage,
        properties: &ApplicationProperties,
    ) -> anyhow::Result<()>;
}

/// Publishes notification references on the notification topic, correlated
/// by the request's Tcv.
pub struct BusNotificationTrigger {
    bus: Arc<dyn MessageBus>,
}

impl BusNotificationTrigger {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl NotificationTrigger for BusNotificationTrigger {
    async fn trigger(
        &self,
        notification: &NotificationMessage,
        properties: &ApplicationProperties,
    ) -> anyhow::Result<()> {
        let message = BusMessage::new(
            properties.clone(),
            notification.telemetry.tcv.clone(),
            notification,
        )?;
        self.bus.publish(Topic::Notification, &message).await?;
        tracing::debug!(key = %notification.key, message_id = %message.message_id, "notification published");
        Ok(())
    }
}

/// Raised whenever a message is dead-lettered.
#[derive(Debug, Clone, Serialize)]
pub struct OperationalAlert {
    pub event_type: String,
    pub reason: DeadLetterReason,
    pub tenant_id: String,
    pub message_id: Uuid,
    pub attempt_count: u32,
    pub error: String,
    pub tcv: String,
    pub raised_at: DateTime<Utc>,
}

impl OperationalAlert {
    pub fn dead_lettered(
        reason: DeadLetterReason,
        tenant_id: &str,
        message_id: Uuid,
        attempt_count: u32,
        error: &str,
        tcv: &str,
    ) -> Self {
        Self {
            event_type: "message_dead_lettered".to_string(),
            reason,
            tenant_id: tenant_id.to_string(),
            message_id,
            attempt_count,
            error: error.to_string(),
            tcv: tcv.to_string(),
            raised_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait Alerter: Send + Sync {
    async fn alert(&self, alert: &OperationalAlert) -> anyhow::Result<()>;
}

/// Logs every alert and forwards it to each configured channel.
///
/// Every channel is attempted even if an earlier one fails.
#[derive(Clone, Default)]
pub struct AlertFanout {
    channels: Vec<Arc<dyn Alerter>>,
}

impl AlertFanout {
    pub fn new(channels: Vec<Arc<dyn Alerter>>) -> Self {
        Self { channels }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[async_trait]
impl Alerter for AlertFanout {
    async fn alert(&self, alert: &OperationalAlert) -> anyhow::Result<()> {
        tracing::error!(
            tenant_id = %alert.tenant_id,
            message_id = %alert.message_id,
            tcv = %alert.tcv,
            reason = alert.reason.as_str(),
            attempt_count = alert.attempt_count,
            error = %alert.error,
            "message dead-lettered"
        );

        let mut failed = 0;
        for channel in &self.channels {
            if let Err(e) = channel.alert(alert).await {
                tracing::warn!(error = %e, "alert channel failed");
                failed += 1;
            }
        }
        if failed > 0 {
            anyhow::bail!("{} of {} alert channels failed", failed, self.channels.len());
        }
        Ok(())
    }
}
