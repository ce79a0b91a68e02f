//! Message broker abstraction (mechanics only).
//!
//! The bridge talks to the broker through two traits:
//!
//! - [`MessageBroker`]: shared, `Send + Sync`, used concurrently by many job
//!   handlers to `produce` and by loops to `subscribe`.
//! - [`BrokerConsumer`]: one per consume loop, owned exclusively by it.
//!
//! ## Delivery guarantees
//!
//! Consumers use **manual commit** only. A message that is consumed but never
//! committed is delivered again to the next consumer of the same group
//! (at-least-once). Consumers must therefore be idempotent.
//!
//! ## Cancellation
//!
//! `consume` may be dropped mid-wait (e.g. inside `tokio::select!` on shutdown).
//! Implementations must not lose a message in that case: at worst it is
//! redelivered to the group later.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Where a message sits in its channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessagePosition {
    /// Log offset (Kafka-style, in-memory broker).
    Offset(u64),
    /// Stream entry id (Redis Streams).
    StreamId(String),
}

impl core::fmt::Display for MessagePosition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MessagePosition::Offset(o) => write!(f, "{o}"),
            MessagePosition::StreamId(id) => f.write_str(id),
        }
    }
}

/// Broker acknowledgement of a successful produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub topic: String,
    pub position: MessagePosition,
}

/// A consumed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub key: Option<String>,
    pub value: String,
    pub position: MessagePosition,
    /// How many times this message has been handed to a consumer of the group.
    pub delivery_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("consumer group error: {0}")]
    ConsumerGroup(String),

    #[error("consumer is closed")]
    Closed,
}

impl From<BrokerError> for flowbridge_core::BridgeError {
    fn from(value: BrokerError) -> Self {
        flowbridge_core::BridgeError::transient(value.to_string())
    }
}

/// Producer side and consumer factory.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Append a keyed message to `topic`.
    async fn produce(&self, topic: &str, key: &str, value: &str) -> Result<DeliveryReport, BrokerError>;

    /// Join consumer group `group` on `topic`.
    ///
    /// The returned consumer starts at the group's last committed position.
    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn BrokerConsumer>, BrokerError>;
}

#[async_trait]
impl<B> MessageBroker for Arc<B>
where
    B: MessageBroker + ?Sized,
{
    async fn produce(&self, topic: &str, key: &str, value: &str) -> Result<DeliveryReport, BrokerError> {
        (**self).produce(topic, key, value).await
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        (**self).subscribe(topic, group).await
    }
}

/// A single consumer-group member, driven by one loop.
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Wait up to `timeout` for the next message. `Ok(None)` means nothing arrived.
    async fn consume(&mut self, timeout: Duration) -> Result<Option<BrokerMessage>, BrokerError>;

    /// Mark `message` as processed for this group.
    async fn commit(&mut self, message: &BrokerMessage) -> Result<(), BrokerError>;

    /// Leave the group. Uncommitted messages stay pending for redelivery.
    async fn close(&mut self) {}
}
