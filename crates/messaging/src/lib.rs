//! Broker-facing messaging: the correlation envelope protocol and the broker abstraction.

pub mod broker;
pub mod envelope;
pub mod in_memory_broker;

pub use broker::{BrokerConsumer, BrokerError, BrokerMessage, DeliveryReport, MessageBroker, MessagePosition};
pub use envelope::{CorrelationEnvelope, EnvelopeError, EnvelopeStatus};
pub use in_memory_broker::InMemoryBroker;
