//! The remote side of the bridge: answers request envelopes on the response channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use flowbridge_core::BridgeError;
use flowbridge_messaging::{BrokerMessage, CorrelationEnvelope, EnvelopeStatus, MessageBroker};

use crate::workers::{ConsumeWorker, ConsumeWorkerConfig, MessageHandler, WorkerHandle};

/// Does the actual work for one request. `Err` becomes an `error` response.
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    async fn process(&self, request: &CorrelationEnvelope) -> Result<JsonValue, String>;
}

/// Answers every request with its own payload; fails requests without a target.
#[derive(Debug, Default)]
pub struct EchoProcessor;

#[async_trait]
impl RequestProcessor for EchoProcessor {
    async fn process(&self, request: &CorrelationEnvelope) -> Result<JsonValue, String> {
        let target = request.target().ok_or_else(|| "request has no target".to_string())?;
        Ok(json!({
            "deliveredTo": target,
            "echo": request.payload(),
        }))
    }
}

#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub request_topic: String,
    pub group: String,
    pub response_topic: String,
    pub poll_timeout: Duration,
}

pub struct Responder {
    broker: Arc<dyn MessageBroker>,
    processor: Arc<dyn RequestProcessor>,
    config: ResponderConfig,
}

impl Responder {
    pub fn new(broker: Arc<dyn MessageBroker>, processor: Arc<dyn RequestProcessor>, config: ResponderConfig) -> Self {
        Self {
            broker,
            processor,
            config,
        }
    }

    pub fn spawn(self, token: CancellationToken) -> WorkerHandle {
        let config = ConsumeWorkerConfig::new("responder", &self.config.request_topic, &self.config.group)
            .with_poll_timeout(self.config.poll_timeout)
            .with_retry_delay(self.config.poll_timeout);
        let broker = self.broker.clone();
        ConsumeWorker::spawn(config, broker, Arc::new(self), token)
    }

    /// Build the response for one request envelope.
    pub async fn respond_to(&self, request: &CorrelationEnvelope) -> CorrelationEnvelope {
        let request_id = request.request_id().clone();
        match self.processor.process(request).await {
            Ok(payload) => CorrelationEnvelope::response(request_id, EnvelopeStatus::Succeeded, None, payload),
            Err(detail) => CorrelationEnvelope::response(request_id, EnvelopeStatus::Failed, Some(detail), JsonValue::Null),
        }
    }
}

#[async_trait]
impl MessageHandler for Responder {
    async fn on_message(&self, message: &BrokerMessage) -> Result<(), BridgeError> {
        let request = match CorrelationEnvelope::decode(&message.value) {
            Ok(request) => request,
            Err(e) => {
                warn!(position = %message.position, error = %BridgeError::from(e), "dropping request");
                return Ok(());
            }
        };

        let response = self.respond_to(&request).await;
        let value = response.encode()?;
        let report = self
            .broker
            .produce(&self.config.response_topic, response.request_id().as_str(), &value)
            .await?;

        info!(
            request_id = %response.request_id(),
            status = %response.status(),
            position = %report.position,
            "response published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use flowbridge_core::RequestId;
    use flowbridge_messaging::{InMemoryBroker, MessagePosition};

    use super::*;

    fn responder(broker: &InMemoryBroker) -> Responder {
        Responder::new(
            Arc::new(broker.clone()),
            Arc::new(EchoProcessor),
            ResponderConfig {
                request_topic: "requests".to_string(),
                group: "responder".to_string(),
                response_topic: "responses".to_string(),
                poll_timeout: Duration::from_millis(10),
            },
        )
    }

    fn message(value: String) -> BrokerMessage {
        BrokerMessage {
            topic: "requests".to_string(),
            key: None,
            value,
            position: MessagePosition::Offset(0),
            delivery_count: 1,
        }
    }

    #[tokio::test]
    async fn answers_with_the_same_request_id_as_key_and_field() {
        let broker = InMemoryBroker::new();
        let request = CorrelationEnvelope::request(RequestId::parse("r1").unwrap(), "x@example.com", json!({"n": 1}));

        responder(&broker)
            .on_message(&message(request.encode().unwrap()))
            .await
            .unwrap();

        let out = broker.published("responses");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key.as_deref(), Some("r1"));
        let response = CorrelationEnvelope::decode(&out[0].value).unwrap();
        assert_eq!(response.request_id().as_str(), "r1");
        assert_eq!(response.status(), EnvelopeStatus::Succeeded);
        assert_eq!(response.payload()["echo"]["n"], 1);
    }

    #[tokio::test]
    async fn processor_failure_becomes_error_response() {
        let broker = InMemoryBroker::new();
        let responder = responder(&broker);
        let request = CorrelationEnvelope::decode(r#"{"requestId":"r2","status":"pending"}"#).unwrap();

        let response = responder.respond_to(&request).await;

        assert_eq!(response.status(), EnvelopeStatus::Failed);
        assert_eq!(response.detail(), Some("request has no target"));
    }

    #[tokio::test]
    async fn undecodable_request_is_committed_without_response() {
        let broker = InMemoryBroker::new();
        responder(&broker).on_message(&message("{}".to_string())).await.unwrap();
        assert!(broker.published("responses").is_empty());
    }

    #[tokio::test]
    async fn produce_failure_leaves_request_uncommitted() {
        let broker = InMemoryBroker::new();
        broker.fail_next_produces(1);
        let request = CorrelationEnvelope::request(RequestId::parse("r3").unwrap(), "x", JsonValue::Null);

        let result = responder(&broker).on_message(&message(request.encode().unwrap())).await;

        assert!(matches!(result, Err(BridgeError::Transient(_))));
    }
}
