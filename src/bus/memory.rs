//! In-process bus for local mode and tests.
//!
//! Mirrors the redis queue semantics: delayed messages become ready at their
//! due time, and locks that expire are reclaimed on the next receive.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{BusError, Delivery, MessageBus};
use crate::models::message::{BusMessage, Topic};

struct Stored {
    message: BusMessage,
    delivery_count: u32,
}

#[derive(Default)]
struct TopicQueue {
    ready: VecDeque<Stored>,
    delayed: Vec<(Instant, Stored)>,
    inflight: HashMap<String, (Instant, Stored)>,
}

impl TopicQueue {
    fn promote(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, stored) = self.delayed.remove(i);
                self.ready.push_back(stored);
            } else {
                i += 1;
            }
        }

        let expired: Vec<String> = self
            .inflight
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some((_, stored)) = self.inflight.remove(&receipt) {
                tracing::debug!(message_id = %stored.message.message_id, "lock expired, message visible again");
                self.ready.push_front(stored);
            }
        }
    }
}

pub struct MemoryBus {
    topics: Mutex<HashMap<Topic, TopicQueue>>,
    lock_duration: Duration,
}

impl MemoryBus {
    pub fn new(lock_duration: Duration) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            lock_duration,
        }
    }

    /// Messages on a topic in any state (ready, delayed or locked).
    pub async fn depth(&self, topic: Topic) -> usize {
        let topics = self.topics.lock().await;
        topics
            .get(&topic)
            .map(|q| q.ready.len() + q.delayed.len() + q.inflight.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: Topic, message: &BusMessage) -> Result<(), BusError> {
        let mut topics = self.topics.lock().await;
        topics.entry(topic).or_default().ready.push_back(Stored {
            message: message.clone(),
            delivery_count: 0,
        });
        Ok(())
    }

    async fn schedule(
        &self,
        topic: Topic,
        message: &BusMessage,
        delay: Duration,
    ) -> Result<(), BusError> {
        if delay.is_zero() {
            return self.publish(topic, message).await;
        }
        let mut topics = self.topics.lock().await;
        topics.entry(topic).or_default().delayed.push((
            Instant::now() + delay,
            Stored {
                message: message.clone(),
                delivery_count: 0,
            },
        ));
        Ok(())
    }

    async fn receive(&self, topic: Topic, max: usize) -> Result<Vec<Delivery>, BusError> {
        let now = Instant::now();
        let mut topics = self.topics.lock().await;
        let queue = topics.entry(topic).or_default();
        queue.promote(now);

        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let Some(mut stored) = queue.ready.pop_front() else {
                break;
            };
            stored.delivery_count += 1;
            let receipt = uuid::Uuid::new_v4().to_string();
            deliveries.push(Delivery {
                topic,
                message: stored.message.clone(),
                delivery_count: stored.delivery_count,
                receipt: receipt.clone(),
            });
            queue
                .inflight
                .insert(receipt, (now + self.lock_duration, stored));
        }
        Ok(deliveries)
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), BusError> {
        let mut topics = self.topics.lock().await;
        let removed = topics
            .get_mut(&delivery.topic)
            .and_then(|q| q.inflight.remove(&delivery.receipt));
        match removed {
            Some(_) => Ok(()),
            None => Err(BusError::LockLost {
                topic: delivery.topic,
                message_id: delivery.message.message_id.to_string(),
            }),
        }
    }

    async fn abandon(&self, delivery: &Delivery) -> Result<(), BusError> {
        let mut topics = self.topics.lock().await;
        if let Some(queue) = topics.get_mut(&delivery.topic) {
            if let Some((_, stored)) = queue.inflight.remove(&delivery.receipt) {
                queue.ready.push_front(stored);
            }
        }
        Ok(())
    }

    async fn defer(&self, delivery: &Delivery, delay: Duration) -> Result<(), BusError> {
        let mut topics = self.topics.lock().await;
        let Some(queue) = topics.get_mut(&delivery.topic) else {
            return Ok(());
        };
        if let Some((_, stored)) = queue.inflight.remove(&delivery.receipt) {
            if delay.is_zero() {
                queue.ready.push_back(stored);
            } else {
                queue.delayed.push((Instant::now() + delay, stored));
            }
        }
        Ok(())
    }

    async fn peek(&self, topic: Topic, max: usize) -> Result<Vec<BusMessage>, BusError> {
        let mut topics = self.topics.lock().await;
        let queue = topics.entry(topic).or_default();
        queue.promote(Instant::now());
        Ok(queue
            .ready
            .iter()
            .take(max)
            .map(|s| s.message.clone())
            .collect())
    }
}
