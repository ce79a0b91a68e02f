//! In-memory broker for tests/dev.
//!
//! - One append-only log per topic
//! - Consumer groups with committed offsets (manual commit only)
//! - A new group member starts at the group's committed offset, so anything
//!   consumed but not committed is redelivered after re-subscription

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::broker::{BrokerConsumer, BrokerError, BrokerMessage, DeliveryReport, MessageBroker, MessagePosition};

#[derive(Debug, Default)]
struct TopicLog {
    entries: Vec<(Option<String>, String)>,
    committed: HashMap<String, u64>,
    deliveries: HashMap<(String, u64), u32>,
}

#[derive(Debug, Default)]
struct Shared {
    topics: Mutex<HashMap<String, TopicLog>>,
    appended: Notify,
    failing_produces: AtomicU32,
}

impl Shared {
    fn topics(&self) -> MutexGuard<'_, HashMap<String, TopicLog>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory, Kafka-flavoured broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` produce calls fail with a connection error.
    pub fn fail_next_produces(&self, n: u32) {
        self.shared.failing_produces.store(n, Ordering::SeqCst);
    }

    /// Snapshot of everything ever appended to `topic`.
    pub fn published(&self, topic: &str) -> Vec<BrokerMessage> {
        let topics = self.shared.topics();
        topics
            .get(topic)
            .map(|log| {
                log.entries
                    .iter()
                    .enumerate()
                    .map(|(offset, (key, value))| BrokerMessage {
                        topic: topic.to_string(),
                        key: key.clone(),
                        value: value.clone(),
                        position: MessagePosition::Offset(offset as u64),
                        delivery_count: 0,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Next offset the group would read after a restart.
    pub fn committed_offset(&self, topic: &str, group: &str) -> u64 {
        let topics = self.shared.topics();
        topics
            .get(topic)
            .and_then(|log| log.committed.get(group).copied())
            .unwrap_or(0)
    }

    fn take_failure(&self) -> bool {
        self.shared
            .failing_produces
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn produce(&self, topic: &str, key: &str, value: &str) -> Result<DeliveryReport, BrokerError> {
        if self.take_failure() {
            warn!(topic, key, "injected produce failure");
            return Err(BrokerError::Connection("injected produce failure".to_string()));
        }

        let offset = {
            let mut topics = self.shared.topics();
            let log = topics.entry(topic.to_string()).or_default();
            log.entries.push((Some(key.to_string()), value.to_string()));
            (log.entries.len() - 1) as u64
        };
        self.shared.appended.notify_waiters();
        debug!(topic, key, offset, "appended");

        Ok(DeliveryReport {
            topic: topic.to_string(),
            position: MessagePosition::Offset(offset),
        })
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        if group.trim().is_empty() {
            return Err(BrokerError::ConsumerGroup("group name is blank".to_string()));
        }
        let position = {
            let mut topics = self.shared.topics();
            let log = topics.entry(topic.to_string()).or_default();
            log.committed.get(group).copied().unwrap_or(0)
        };

        Ok(Box::new(InMemoryConsumer {
            shared: self.shared.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            position,
            closed: false,
        }))
    }
}

#[derive(Debug)]
struct InMemoryConsumer {
    shared: Arc<Shared>,
    topic: String,
    group: String,
    position: u64,
    closed: bool,
}

impl InMemoryConsumer {
    fn next_ready(&mut self) -> Option<BrokerMessage> {
        let mut topics = self.shared.topics();
        let log = topics.entry(self.topic.clone()).or_default();
        let (key, value) = log.entries.get(self.position as usize).cloned()?;

        let offset = self.position;
        let count = log.deliveries.entry((self.group.clone(), offset)).or_insert(0);
        *count += 1;
        let delivery_count = *count;
        self.position += 1;

        Some(BrokerMessage {
            topic: self.topic.clone(),
            key,
            value,
            position: MessagePosition::Offset(offset),
            delivery_count,
        })
    }
}

#[async_trait]
impl BrokerConsumer for InMemoryConsumer {
    async fn consume(&mut self, timeout: Duration) -> Result<Option<BrokerMessage>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let shared = self.shared.clone();
            let appended = shared.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(msg) = self.next_ready() {
                return Ok(Some(msg));
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, message: &BrokerMessage) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let MessagePosition::Offset(offset) = message.position else {
            return Err(BrokerError::Command(format!(
                "cannot commit foreign position {}",
                message.position
            )));
        };

        let mut topics = self.shared.topics();
        let log = topics.entry(self.topic.clone()).or_default();
        let committed = log.committed.entry(self.group.clone()).or_insert(0);
        *committed = (*committed).max(offset + 1);
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consume_returns_published_messages_in_order() {
        let broker = InMemoryBroker::new();
        broker.produce("t", "k1", "v1").await.unwrap();
        broker.produce("t", "k2", "v2").await.unwrap();

        let mut consumer = broker.subscribe("t", "g").await.unwrap();
        let first = consumer.consume(Duration::from_millis(10)).await.unwrap().unwrap();
        let second = consumer.consume(Duration::from_millis(10)).await.unwrap().unwrap();

        assert_eq!(first.key.as_deref(), Some("k1"));
        assert_eq!(second.value, "v2");
        assert!(consumer.consume(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn consume_wakes_up_on_publish() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.subscribe("t", "g").await.unwrap();

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.produce("t", "k", "late").await.unwrap();
        });

        let msg = consumer.consume(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(msg.value, "late");
    }

    #[tokio::test]
    async fn uncommitted_messages_are_redelivered_to_the_next_member() {
        let broker = InMemoryBroker::new();
        broker.produce("t", "a", "1").await.unwrap();
        broker.produce("t", "b", "2").await.unwrap();

        let mut consumer = broker.subscribe("t", "g").await.unwrap();
        let first = consumer.consume(Duration::from_millis(10)).await.unwrap().unwrap();
        consumer.commit(&first).await.unwrap();
        let second = consumer.consume(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(second.delivery_count, 1);
        consumer.close().await;

        let mut again = broker.subscribe("t", "g").await.unwrap();
        let redelivered = again.consume(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(redelivered.value, "2");
        assert_eq!(redelivered.delivery_count, 2);
        assert_eq!(broker.committed_offset("t", "g"), 1);
    }

    #[tokio::test]
    async fn groups_track_offsets_independently() {
        let broker = InMemoryBroker::new();
        broker.produce("t", "a", "1").await.unwrap();

        let mut g1 = broker.subscribe("t", "g1").await.unwrap();
        let msg = g1.consume(Duration::from_millis(10)).await.unwrap().unwrap();
        g1.commit(&msg).await.unwrap();

        let mut g2 = broker.subscribe("t", "g2").await.unwrap();
        assert!(g2.consume(Duration::from_millis(10)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_one_by_one() {
        let broker = InMemoryBroker::new();
        broker.fail_next_produces(1);

        assert!(matches!(broker.produce("t", "k", "v").await, Err(BrokerError::Connection(_))));
        assert!(broker.produce("t", "k", "v").await.is_ok());
        assert_eq!(broker.published("t").len(), 1);
    }

    #[tokio::test]
    async fn closed_consumer_refuses_work() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.subscribe("t", "g").await.unwrap();
        consumer.close().await;
        assert_eq!(consumer.consume(Duration::from_millis(1)).await, Err(BrokerError::Closed));
    }
}
