//! Message bus seam.
//!
//! Delivery is at-least-once: a received message stays locked for the bus's
//! lock duration and becomes visible again if it is neither completed nor
//! abandoned in time. Consumers must be idempotent.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::message::{BusMessage, Topic};

pub mod memory;
pub mod redis_queue;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("lock lost for message {message_id} on {topic}")]
    LockLost { topic: Topic, message_id: String },

    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

/// A locked message handed to one consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: Topic,
    pub message: BusMessage,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
    /// Lock token of this receive; settling with a stale token fails.
    pub(crate) receipt: String,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Make a message immediately available on `topic`.
    async fn publish(&self, topic: Topic, message: &BusMessage) -> Result<(), BusError>;

    /// Make a message available on `topic` after `delay`.
    async fn schedule(
        &self,
        topic: Topic,
        message: &BusMessage,
        delay: Duration,
    ) -> Result<(), BusError>;

    /// Lock and return up to `max` available messages.
    async fn receive(&self, topic: Topic, max: usize) -> Result<Vec<Delivery>, BusError>;

    /// Acknowledge a delivery; the message is removed.
    async fn complete(&self, delivery: &Delivery) -> Result<(), BusError>;

    /// Release a delivery without acknowledging; it becomes visible again.
    async fn abandon(&self, delivery: &Delivery) -> Result<(), BusError>;

    /// Release a delivery so it becomes visible again after `delay`. The
    /// delivery count is kept, so repeated failures stay bounded.
    async fn defer(&self, delivery: &Delivery, delay: Duration) -> Result<(), BusError>;

    /// Read up to `max` available messages without locking them.
    async fn peek(&self, topic: Topic, max: usize) -> Result<Vec<BusMessage>, BusError>;
}
