//! Inbound bridge: broker response → correlation message into the engine.
//!
//! Per message: `received → decoded → resumed → committed`, or
//! `received → dropped → committed` (malformed / unknown request), or
//! `received → error → redelivered` (resume did not answer in time).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use flowbridge_core::{BridgeError, Variables};
use flowbridge_messaging::{BrokerMessage, CorrelationEnvelope, EnvelopeStatus, MessageBroker};

use crate::engine::{CorrelationMessage, WorkflowEngine};
use crate::workers::{ConsumeWorker, ConsumeWorkerConfig, MessageHandler, WorkerHandle};

use super::registry::CorrelationRegistry;

#[derive(Debug, Clone)]
pub struct InboundConfig {
    pub response_topic: String,
    pub group: String,
    /// Correlation message name the receive step subscribes to.
    pub message_name: String,
    pub poll_timeout: Duration,
    /// How long a resume call may take before the message is left for redelivery.
    pub resume_timeout: Duration,
    /// Resolved registry records older than this are evicted while idle.
    pub prune_after: Duration,
    /// Pending registry records older than this are evicted while idle.
    pub pending_ttl: Duration,
}

impl InboundConfig {
    pub fn new(response_topic: impl Into<String>, group: impl Into<String>, message_name: impl Into<String>) -> Self {
        Self {
            response_topic: response_topic.into(),
            group: group.into(),
            message_name: message_name.into(),
            poll_timeout: Duration::from_secs(1),
            resume_timeout: Duration::from_secs(10),
            prune_after: Duration::from_secs(3600),
            pending_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    MissingRequestId,
    UnknownRequest,
}

/// What happened to one response. Every disposition is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Resumed,
    /// The engine answered the resume call with an error.
    ResumeFailed,
    Dropped(DropReason),
}

pub struct InboundBridge {
    engine: Arc<dyn WorkflowEngine>,
    registry: Arc<CorrelationRegistry>,
    config: InboundConfig,
}

impl InboundBridge {
    pub fn new(engine: Arc<dyn WorkflowEngine>, registry: Arc<CorrelationRegistry>, config: InboundConfig) -> Self {
        Self {
            engine,
            registry,
            config,
        }
    }

    /// Start the consume loop on the response topic.
    pub fn spawn(self, broker: Arc<dyn MessageBroker>, token: CancellationToken) -> WorkerHandle {
        let config = ConsumeWorkerConfig::new("inbound-bridge", &self.config.response_topic, &self.config.group)
            .with_poll_timeout(self.config.poll_timeout)
            .with_retry_delay(self.config.poll_timeout);
        ConsumeWorker::spawn(config, broker, Arc::new(self), token)
    }

    /// Handle one response. `Err` means "do not commit".
    pub async fn process(&self, message: &BrokerMessage) -> Result<Disposition, BridgeError> {
        let envelope = match CorrelationEnvelope::decode(&message.value) {
            Ok(envelope) => envelope,
            Err(e) => {
                let reason = match e {
                    flowbridge_messaging::EnvelopeError::MissingRequestId => DropReason::MissingRequestId,
                    _ => DropReason::Malformed,
                };
                let violation = BridgeError::from(e);
                warn!(
                    topic = %message.topic,
                    position = %message.position,
                    key = ?message.key,
                    error = %violation,
                    "dropping response"
                );
                return Ok(Disposition::Dropped(reason));
            }
        };

        let request_id = envelope.request_id().clone();
        let Some(record) = self.registry.lookup(&request_id) else {
            warn!(
                request_id = %request_id,
                position = %message.position,
                "dropping response for unknown request"
            );
            return Ok(Disposition::Dropped(DropReason::UnknownRequest));
        };

        let (status, detail) = match envelope.status() {
            EnvelopeStatus::Pending => (
                EnvelopeStatus::Failed,
                Some("response reported non-terminal status 'pending'".to_string()),
            ),
            status => (status, envelope.detail().map(str::to_string)),
        };

        let resume = CorrelationMessage {
            name: self.config.message_name.clone(),
            correlation_key: request_id.to_string(),
            variables: resume_variables(&envelope, status, detail.as_deref()),
            time_to_live: None,
        };

        match tokio::time::timeout(self.config.resume_timeout, self.engine.publish_message(&resume)).await {
            Ok(Ok(())) => {
                self.registry.resolve(&request_id, status);
                info!(
                    request_id = %request_id,
                    process_instance_key = %record.process_instance_key,
                    status = %status,
                    delivery_count = message.delivery_count,
                    "process instance resumed"
                );
                Ok(Disposition::Resumed)
            }
            Ok(Err(e)) => {
                warn!(request_id = %request_id, error = %e, "engine refused resume, committing response");
                Ok(Disposition::ResumeFailed)
            }
            Err(_) => Err(BridgeError::transient(format!(
                "resume for {request_id} did not answer within {}ms",
                self.config.resume_timeout.as_millis()
            ))),
        }
    }
}

fn resume_variables(envelope: &CorrelationEnvelope, status: EnvelopeStatus, detail: Option<&str>) -> Variables {
    let mut vars = Variables::new();
    vars.insert("status".to_string(), json!(status.as_str()));
    vars.insert("requestId".to_string(), json!(envelope.request_id().as_str()));
    if let Some(detail) = detail {
        vars.insert("detail".to_string(), json!(detail));
    }
    vars.insert(
        "response".to_string(),
        json!({
            "status": status.as_str(),
            "detail": detail,
            "payload": envelope.payload(),
            "sentAt": envelope.created_at().to_rfc3339(),
            "receivedAt": Utc::now().to_rfc3339(),
        }),
    );
    vars
}

#[async_trait]
impl MessageHandler for InboundBridge {
    async fn on_message(&self, message: &BrokerMessage) -> Result<(), BridgeError> {
        self.process(message).await.map(|_| ())
    }

    async fn on_idle(&self) {
        let pruned = self.registry.prune(self.config.prune_after, self.config.pending_ttl);
        if pruned > 0 {
            tracing::debug!(pruned, "pruned stale correlations");
        }
    }
}
