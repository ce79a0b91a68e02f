//! Outbound bridge: job → request envelope on the broker.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use flowbridge_core::variables::{optional_str, require_str};
use flowbridge_core::{BridgeError, RequestId, Variables};
use flowbridge_messaging::{CorrelationEnvelope, MessageBroker};

use crate::engine::Job;
use crate::jobs::{JobClient, JobHandler};

use super::registry::CorrelationRegistry;

/// Job variable carrying an already-minted request id.
pub const REQUEST_ID_VAR: &str = "requestId";
/// Job variable overriding the request topic.
pub const TOPIC_VAR: &str = "topic";
/// Job variable carrying the payload; without it, the remaining variables are sent.
pub const PAYLOAD_VAR: &str = "payload";

#[derive(Debug, Clone)]
pub struct OutboundConfig {
    pub request_topic: String,
    /// Required job variable naming the recipient.
    pub target_field: String,
}

/// Publishes one request per job, keyed by its request id.
///
/// Registers the id before producing, so a response that arrives faster than
/// the produce call returns is still recognized.
pub struct OutboundBridge {
    broker: Arc<dyn MessageBroker>,
    registry: Arc<CorrelationRegistry>,
    config: OutboundConfig,
}

impl OutboundBridge {
    pub fn new(broker: Arc<dyn MessageBroker>, registry: Arc<CorrelationRegistry>, config: OutboundConfig) -> Self {
        Self {
            broker,
            registry,
            config,
        }
    }

    /// Build the request envelope for `job` without publishing it.
    pub fn envelope_for(&self, job: &Job) -> Result<(String, CorrelationEnvelope), BridgeError> {
        let vars = &job.variables;
        let target = require_str(vars, &self.config.target_field)?;

        let request_id = match optional_str(vars, REQUEST_ID_VAR) {
            Some(existing) => RequestId::parse(existing)?,
            None => RequestId::generate(),
        };
        let topic = optional_str(vars, TOPIC_VAR).unwrap_or(&self.config.request_topic).to_string();

        let payload = match vars.get(PAYLOAD_VAR) {
            Some(payload) => payload.clone(),
            None => {
                let rest: Variables = vars
                    .iter()
                    .filter(|(k, _)| {
                        let k = k.as_str();
                        k != self.config.target_field && k != REQUEST_ID_VAR && k != TOPIC_VAR
                    })
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                JsonValue::Object(rest)
            }
        };

        Ok((topic, CorrelationEnvelope::request(request_id, target, payload)))
    }
}

#[async_trait]
impl JobHandler for OutboundBridge {
    async fn handle(&self, job: Job, _client: JobClient) -> Result<Variables, BridgeError> {
        let (topic, envelope) = self.envelope_for(&job)?;
        let request_id = envelope.request_id().clone();
        let value = envelope.encode()?;

        let replaced = self.registry.register(request_id.clone(), job.key, job.process_instance_key);

        match self.broker.produce(&topic, request_id.as_str(), &value).await {
            Ok(report) => {
                info!(
                    job_key = %job.key,
                    request_id = %request_id,
                    topic = %topic,
                    position = %report.position,
                    "request published"
                );
                let mut out = Variables::new();
                out.insert("status".to_string(), json!("success"));
                out.insert("topic".to_string(), json!(topic));
                out.insert(REQUEST_ID_VAR.to_string(), json!(request_id.as_str()));
                Ok(out)
            }
            Err(e) => {
                warn!(job_key = %job.key, request_id = %request_id, topic = %topic, error = %e, "request publish failed");
                // An earlier attempt may already be on the wire under this id.
                match replaced {
                    Some(previous) => self.registry.restore(previous),
                    None => self.registry.unregister(&request_id),
                }
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use flowbridge_core::{JobKey, ProcessInstanceKey};
    use flowbridge_messaging::{EnvelopeStatus, InMemoryBroker};

    use super::*;
    use crate::engine::InMemoryWorkflowEngine;
    use crate::jobs::InMemoryJobTrackingStore;

    fn job(key: i64, vars: JsonValue) -> Job {
        Job {
            key: JobKey::new(key),
            job_type: "bridge".to_string(),
            process_instance_key: ProcessInstanceKey::new(100 + key),
            bpmn_process_id: "p".to_string(),
            element_id: "publish".to_string(),
            variables: match vars {
                JsonValue::Object(map) => map,
                _ => Variables::new(),
            },
            retries: 3,
            deadline: None,
            worker: "w".to_string(),
        }
    }

    fn setup() -> (InMemoryBroker, Arc<CorrelationRegistry>, OutboundBridge, JobClient) {
        let broker = InMemoryBroker::new();
        let registry = Arc::new(CorrelationRegistry::new());
        let bridge = OutboundBridge::new(
            Arc::new(broker.clone()),
            registry.clone(),
            OutboundConfig {
                request_topic: "requests".to_string(),
                target_field: "target".to_string(),
            },
        );
        let client = JobClient::new(Arc::new(InMemoryWorkflowEngine::new()), InMemoryJobTrackingStore::arc());
        (broker, registry, bridge, client)
    }

    #[tokio::test]
    async fn publishes_keyed_request_and_reports_success() {
        let (broker, registry, bridge, client) = setup();

        let out = bridge
            .handle(job(1, json!({"target": "a@example.com", "subject": "hi"})), client)
            .await
            .unwrap();

        assert_eq!(out["status"], "success");
        assert_eq!(out["topic"], "requests");

        let published = broker.published("requests");
        assert_eq!(published.len(), 1);
        let request_id = out["requestId"].as_str().unwrap();
        assert_eq!(published[0].key.as_deref(), Some(request_id));

        let envelope = CorrelationEnvelope::decode(&published[0].value).unwrap();
        assert_eq!(envelope.request_id().as_str(), request_id);
        assert_eq!(envelope.target(), Some("a@example.com"));
        assert_eq!(envelope.payload()["subject"], "hi");
        assert!(envelope.payload().get("target").is_none());

        let record = registry.lookup(envelope.request_id()).unwrap();
        assert_eq!(record.status, EnvelopeStatus::Pending);
        assert_eq!(record.job_key, JobKey::new(1));
    }

    #[tokio::test]
    async fn missing_target_fails_validation_without_publishing() {
        let (broker, registry, bridge, client) = setup();

        let err = bridge.handle(job(2, json!({})), client).await.unwrap_err();

        assert!(matches!(err, BridgeError::Validation(_)));
        assert!(broker.published("requests").is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn reuses_minted_request_id_and_topic_override() {
        let (broker, _registry, bridge, client) = setup();

        let out = bridge
            .handle(
                job(3, json!({"target": "x", "requestId": "req-7", "topic": "alt", "payload": {"n": 1}})),
                client,
            )
            .await
            .unwrap();

        assert_eq!(out["requestId"], "req-7");
        let published = broker.published("alt");
        assert_eq!(published[0].key.as_deref(), Some("req-7"));
        let envelope = CorrelationEnvelope::decode(&published[0].value).unwrap();
        assert_eq!(envelope.payload(), &json!({"n": 1}));
    }

    #[tokio::test]
    async fn publish_failure_is_transient_and_unregisters() {
        let (broker, registry, bridge, client) = setup();
        broker.fail_next_produces(1);

        let err = bridge.handle(job(4, json!({"target": "x"})), client).await.unwrap_err();

        assert!(matches!(err, BridgeError::Transient(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn failed_republish_keeps_the_earlier_attempts_record() {
        let (broker, registry, bridge, client) = setup();
        let retried = job(5, json!({"target": "x", "requestId": "req-9"}));

        bridge.handle(retried.clone(), client.clone()).await.unwrap();
        broker.fail_next_produces(1);
        let err = bridge.handle(retried, client).await.unwrap_err();

        assert!(matches!(err, BridgeError::Transient(_)));
        let record = registry.lookup(&RequestId::parse("req-9").unwrap()).unwrap();
        assert_eq!(record.status, EnvelopeStatus::Pending);
        assert_eq!(record.job_key, JobKey::new(5));
        assert_eq!(broker.published("requests").len(), 1);
    }

    #[tokio::test]
    async fn every_request_gets_a_distinct_id() {
        let (broker, _registry, bridge, client) = setup();
        for key in 0..50 {
            bridge
                .handle(job(key, json!({"target": "x"})), client.clone())
                .await
                .unwrap();
        }

        let keys: HashSet<_> = broker
            .published("requests")
            .into_iter()
            .filter_map(|m| m.key)
            .collect();
        assert_eq!(keys.len(), 50);
    }
}
