//! Operator access to the dead-letter topic.

use std::sync::Arc;

use anyhow::Context;
use uuid::Uuid;

use crate::bus::{Delivery, MessageBus};
use crate::models::message::{BusMessage, DeadLetterRecord, Topic};

#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub message_id: Uuid,
    pub correlation_id: String,
    pub record: DeadLetterRecord,
}

pub struct DeadLetterQueue {
    bus: Arc<dyn MessageBus>,
}

impl DeadLetterQueue {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    /// Up to `max` dead-lettered messages, oldest first.
    pub async fn list(&self, max: usize) -> anyhow::Result<Vec<DeadLetterEntry>> {
        let messages = self.bus.peek(Topic::DeadLetter, max).await?;
        Ok(messages
            .into_iter()
            .filter_map(|m| match m.decode::<DeadLetterRecord>() {
                Ok(record) => Some(DeadLetterEntry {
                    message_id: m.message_id,
                    correlation_id: m.correlation_id,
                    record,
                }),
                Err(e) => {
                    tracing::warn!(message_id = %m.message_id, "skipping undecodable dead-letter entry: {}", e);
                    None
                }
            })
            .collect())
    }

    /// Put one dead-lettered request back on the main topic.
    ///
    /// `id` matches either the dead-letter message id or the original message
    /// id. Only the first `scan` messages are searched. The replay is a fresh
    /// pointer message with a new id; returns that id, or `None` when nothing
    /// matched.
    pub async fn replay(&self, id: Uuid, scan: usize) -> anyhow::Result<Option<Uuid>> {
        let deliveries = self.bus.receive(Topic::DeadLetter, scan).await?;

        let Some(index) = deliveries.iter().position(|d| Self::is_entry(d, id)) else {
            self.release(&deliveries, None).await?;
            return Ok(None);
        };
        let delivery = &deliveries[index];

        let (record, replayed) = match Self::replay_message(delivery) {
            Ok(built) => built,
            Err(e) => {
                self.release(&deliveries, None).await?;
                return Err(e);
            }
        };
        if let Err(e) = self.bus.publish(Topic::Main, &replayed).await {
            self.release(&deliveries, None).await?;
            return Err(e.into());
        }
        self.bus.complete(delivery).await?;
        self.release(&deliveries, Some(index)).await?;

        tracing::info!(
            original_message_id = %record.original_message_id,
            replay_message_id = %replayed.message_id,
            tenant_id = %record.tenant_id,
            "dead-letter replayed"
        );
        Ok(Some(replayed.message_id))
    }

    fn is_entry(delivery: &Delivery, id: Uuid) -> bool {
        delivery.message.message_id == id
            || delivery
                .message
                .decode::<DeadLetterRecord>()
                .map(|r| r.original_message_id == id)
                .unwrap_or(false)
    }

    fn replay_message(delivery: &Delivery) -> anyhow::Result<(DeadLetterRecord, BusMessage)> {
        let record: DeadLetterRecord = delivery
            .message
            .decode()
            .context("dead-letter entry is not a dead-letter record")?;
        let Some(pointer) = record.payload_pointer.clone() else {
            anyhow::bail!(
                "message {} has no payload pointer ({}) and cannot be replayed",
                record.original_message_id,
                record.reason.as_str()
            );
        };

        let mut properties = delivery.message.application_properties.clone();
        properties.created_date = chrono::Utc::now();
        let replayed = BusMessage::new(properties, delivery.message.correlation_id.clone(), &pointer)?;
        Ok((record, replayed))
    }

    /// Abandon scanned deliveries back to front. Each abandon goes to the
    /// head of the queue, so this leaves the original order intact.
    async fn release(&self, deliveries: &[Delivery], skip: Option<usize>) -> anyhow::Result<()> {
        for (i, delivery) in deliveries.iter().enumerate().rev() {
            if Some(i) != skip {
                self.bus.abandon(delivery).await?;
            }
        }
        Ok(())
    }
}
