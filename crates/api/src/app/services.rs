//! Explicit dependency wiring: engine, broker, stores, and every background loop.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use flowbridge_infra::bridge::{
    CorrelationRegistry, EchoProcessor, ERROR_HANDLER, GENERATE_REQUEST_ID, GenerateRequestId, InboundBridge,
    InboundConfig, OutboundBridge, OutboundConfig, Outcome, Responder, ResponderConfig, ResponseLogger,
    SUCCESS_HANDLER,
};
use flowbridge_infra::broker::RedisStreamsBroker;
use flowbridge_infra::config::{BridgeConfig, BrokerMode, EngineMode};
use flowbridge_infra::engine::{InMemoryWorkflowEngine, RestWorkflowEngine, WorkflowEngine};
use flowbridge_infra::jobs::{InMemoryJobTrackingStore, JobClient, JobHandler, JobWorker, JobWorkerConfig};
use flowbridge_infra::workers::WorkerHandle;
use flowbridge_messaging::{InMemoryBroker, MessageBroker};

/// Everything the HTTP handlers and the loops share.
#[derive(Clone)]
pub struct AppServices {
    pub engine: Arc<dyn WorkflowEngine>,
    pub broker: Arc<dyn MessageBroker>,
    pub store: Arc<InMemoryJobTrackingStore>,
    pub registry: Arc<CorrelationRegistry>,
    pub client: JobClient,
}

impl AppServices {
    pub fn new(engine: Arc<dyn WorkflowEngine>, broker: Arc<dyn MessageBroker>) -> Self {
        let store = InMemoryJobTrackingStore::arc();
        let client = JobClient::new(engine.clone(), store.clone());
        Self {
            engine,
            broker,
            store,
            registry: Arc::new(CorrelationRegistry::new()),
            client,
        }
    }

    /// Pick engine and broker implementations from `config`.
    pub fn from_config(config: &BridgeConfig) -> anyhow::Result<Self> {
        let engine: Arc<dyn WorkflowEngine> = match config.engine.mode {
            EngineMode::Rest => {
                let engine = RestWorkflowEngine::new(config.engine.rest_config())
                    .context("failed to build workflow-engine client")?;
                info!(gateway = %engine.base_url(), "using REST workflow engine");
                Arc::new(engine)
            }
            EngineMode::Memory => {
                info!("using in-memory workflow engine");
                Arc::new(InMemoryWorkflowEngine::new())
            }
        };

        let broker: Arc<dyn MessageBroker> = match config.broker.mode {
            BrokerMode::Redis => {
                let broker = RedisStreamsBroker::new(
                    &config.broker.redis_url,
                    config.worker.name.clone(),
                    config.broker.publish_retries,
                )
                .context("failed to build redis broker")?;
                info!(url = %config.broker.redis_url, "using redis streams broker");
                Arc::new(broker)
            }
            BrokerMode::Memory => {
                info!("using in-memory broker");
                Arc::new(InMemoryBroker::new())
            }
        };

        Ok(Self::new(engine, broker))
    }

    /// Spawn the job workers, the inbound bridge and (when enabled) the responder.
    ///
    /// Every registration is validated before anything is spawned.
    pub fn start_workers(&self, config: &BridgeConfig, token: &CancellationToken) -> anyhow::Result<Vec<WorkerHandle>> {
        let outbound = OutboundBridge::new(
            self.broker.clone(),
            self.registry.clone(),
            OutboundConfig {
                request_topic: config.bridge.request_topic.clone(),
                target_field: config.bridge.target_field.clone(),
            },
        );

        let registrations: Vec<(JobWorkerConfig, Arc<dyn JobHandler>)> = vec![
            (config.worker_config(&config.bridge.job_type), Arc::new(outbound) as Arc<dyn JobHandler>),
            (config.worker_config(GENERATE_REQUEST_ID), Arc::new(GenerateRequestId) as Arc<dyn JobHandler>),
            (config.worker_config(SUCCESS_HANDLER), Arc::new(ResponseLogger::new(Outcome::Success)) as Arc<dyn JobHandler>),
            (config.worker_config(ERROR_HANDLER), Arc::new(ResponseLogger::new(Outcome::Error)) as Arc<dyn JobHandler>),
        ];
        let mut handles =
            JobWorker::spawn_all(registrations, &self.client, token).context("invalid job worker registration")?;

        let mut inbound = InboundConfig::new(
            &config.bridge.response_topic,
            &config.bridge.response_group,
            &config.bridge.message_name,
        );
        inbound.poll_timeout = config.worker.poll_interval;
        inbound.pending_ttl = config.bridge.pending_ttl;
        handles.push(
            InboundBridge::new(self.engine.clone(), self.registry.clone(), inbound)
                .spawn(self.broker.clone(), token.child_token()),
        );

        if config.bridge.responder_enabled {
            let responder = Responder::new(
                self.broker.clone(),
                Arc::new(EchoProcessor),
                ResponderConfig {
                    request_topic: config.bridge.request_topic.clone(),
                    group: config.bridge.request_group.clone(),
                    response_topic: config.bridge.response_topic.clone(),
                    poll_timeout: config.worker.poll_interval,
                },
            );
            handles.push(responder.spawn(token.child_token()));
        }

        info!(loops = handles.len(), "background loops started");
        Ok(handles)
    }
}
