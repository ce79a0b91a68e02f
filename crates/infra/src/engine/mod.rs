//! Workflow-engine job-worker contract.
//!
//! The bridge only ever talks to the engine through [`WorkflowEngine`]. Every
//! call is a separate request/response; failures come back as [`EngineError`]
//! and are handled at the call site (a loop never dies because of one).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flowbridge_core::{BridgeError, JobKey, ProcessInstanceKey, Variables};

pub mod in_memory;
pub mod rest;

pub use in_memory::InMemoryWorkflowEngine;
pub use rest::{RestEngineConfig, RestWorkflowEngine};

/// One unit of work offered by the engine to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub key: JobKey,
    #[serde(rename = "type")]
    pub job_type: String,
    pub process_instance_key: ProcessInstanceKey,
    #[serde(default)]
    pub bpmn_process_id: String,
    #[serde(default)]
    pub element_id: String,
    #[serde(default)]
    pub variables: Variables,
    /// Remaining attempt budget.
    pub retries: u32,
    /// When the engine reclaims the job if it is neither completed nor failed.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub worker: String,
}

impl Job {
    /// Retry budget to report on failure: one less, never below zero.
    pub fn retries_after_failure(&self) -> u32 {
        self.retries.saturating_sub(1)
    }
}

/// Parameters of one activation (poll) call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateJobsRequest {
    pub job_type: String,
    pub worker: String,
    pub max_jobs: u32,
    /// How long activated jobs stay exclusively ours.
    pub timeout: Duration,
    /// Long-poll budget for the activation call itself.
    pub request_timeout: Duration,
}

/// Message that resumes a process instance waiting on a receive step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationMessage {
    pub name: String,
    pub correlation_key: String,
    pub variables: Variables,
    #[serde(skip)]
    pub time_to_live: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerNode {
    pub node_id: i32,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    pub brokers: Vec<BrokerNode>,
    pub cluster_size: u32,
    pub partitions_count: u32,
    pub replication_factor: u32,
    pub gateway_version: String,
}

impl Topology {
    pub fn broker_count(&self) -> usize {
        self.brokers.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("engine unreachable: {0}")]
    Transport(String),

    #[error("engine rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unexpected engine response: {0}")]
    Decode(String),
}

impl From<EngineError> for BridgeError {
    fn from(value: EngineError) -> Self {
        BridgeError::transient(value.to_string())
    }
}

/// Calls the bridge makes into the workflow engine.
///
/// Implementations must be safe for concurrent use by every poll loop,
/// handler and consume loop in the process.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Activate up to `max_jobs` jobs of one type. An empty vec means none were available.
    async fn activate_jobs(&self, request: &ActivateJobsRequest) -> Result<Vec<Job>, EngineError>;

    async fn complete_job(&self, key: JobKey, variables: Variables) -> Result<(), EngineError>;

    /// Report a failed attempt; `retries == 0` turns the job into an incident.
    async fn fail_job(&self, key: JobKey, retries: u32, error_message: &str) -> Result<(), EngineError>;

    async fn publish_message(&self, message: &CorrelationMessage) -> Result<(), EngineError>;

    async fn cancel_instance(&self, key: ProcessInstanceKey) -> Result<(), EngineError>;

    async fn topology(&self) -> Result<Topology, EngineError>;
}

#[async_trait]
impl<E> WorkflowEngine for Arc<E>
where
    E: WorkflowEngine + ?Sized,
{
    async fn activate_jobs(&self, request: &ActivateJobsRequest) -> Result<Vec<Job>, EngineError> {
        (**self).activate_jobs(request).await
    }

    async fn complete_job(&self, key: JobKey, variables: Variables) -> Result<(), EngineError> {
        (**self).complete_job(key, variables).await
    }

    async fn fail_job(&self, key: JobKey, retries: u32, error_message: &str) -> Result<(), EngineError> {
        (**self).fail_job(key, retries, error_message).await
    }

    async fn publish_message(&self, message: &CorrelationMessage) -> Result<(), EngineError> {
        (**self).publish_message(message).await
    }

    async fn cancel_instance(&self, key: ProcessInstanceKey) -> Result<(), EngineError> {
        (**self).cancel_instance(key).await
    }

    async fn topology(&self) -> Result<Topology, EngineError> {
        (**self).topology().await
    }
}
