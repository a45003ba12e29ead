//! In-process message bus

use super::{Delivery, MessageBus};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

#[derive(Default)]
struct TopicQueue {
    ready: VecDeque<Delivery>,
    in_flight: HashMap<Uuid, Delivery>,
    notify: Arc<Notify>,
}

impl TopicQueue {
    fn requeue(&mut self, delivery: Delivery) {
        self.ready.push_back(delivery);
        self.notify.notify_one();
    }
}

type Topics = Arc<Mutex<HashMap<String, TopicQueue>>>;

/// A [`MessageBus`] held entirely in memory.
///
/// Polled messages stay in flight until acked. Nacked messages go to the back
/// of their topic with `attempt` incremented, after the requested delay.
/// Nothing survives the process.
#[derive(Default)]
pub struct MemoryBus {
    topics: Topics,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting to be polled on `topic`
    pub async fn pending(&self, topic: &str) -> usize {
        let topics = self.topics.lock().await;
        topics.get(topic).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Messages polled but not yet acked or nacked on `topic`
    pub async fn in_flight(&self, topic: &str) -> usize {
        let topics = self.topics.lock().await;
        topics.get(topic).map(|q| q.in_flight.len()).unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()> {
        let mut topics = self.topics.lock().await;
        let queue = topics.entry(topic.to_string()).or_default();
        queue.ready.push_back(Delivery {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
            attempt: 1,
        });
        queue.notify.notify_one();
        trace!(topic, key, "Published message");
        Ok(())
    }

    async fn poll(&self, topic: &str, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notify = {
                let mut topics = self.topics.lock().await;
                let queue = topics.entry(topic.to_string()).or_default();
                if let Some(delivery) = queue.ready.pop_front() {
                    queue.in_flight.insert(delivery.id, delivery.clone());
                    return Ok(Some(delivery));
                }
                Arc::clone(&queue.notify)
            };

            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut topics = self.topics.lock().await;
        let removed = topics
            .get_mut(&delivery.topic)
            .and_then(|q| q.in_flight.remove(&delivery.id));
        if removed.is_none() {
            return Err(Error::Bus(format!("unknown delivery {}", delivery.id)));
        }
        Ok(())
    }

    async fn nack(&self, delivery: Delivery, delay: Duration) -> Result<()> {
        let mut topics = self.topics.lock().await;
        let queue = topics
            .get_mut(&delivery.topic)
            .ok_or_else(|| Error::Bus(format!("unknown topic '{}'", delivery.topic)))?;

        let mut redelivery = queue
            .in_flight
            .remove(&delivery.id)
            .ok_or_else(|| Error::Bus(format!("unknown delivery {}", delivery.id)))?;
        redelivery.attempt += 1;
        debug!(
            topic = %redelivery.topic,
            key = %redelivery.key,
            attempt = redelivery.attempt,
            delay_ms = delay.as_millis() as u64,
            "Requeued message"
        );

        if delay.is_zero() {
            queue.requeue(redelivery);
            return Ok(());
        }

        let topics = Arc::clone(&self.topics);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut topics = topics.lock().await;
            topics
                .entry(redelivery.topic.clone())
                .or_default()
                .requeue(redelivery);
        });
        Ok(())
    }
}
