//! REST client for the engine gateway (v2 API).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use flowbridge_core::{JobKey, ProcessInstanceKey, Variables};

use super::{ActivateJobsRequest, BrokerNode, CorrelationMessage, EngineError, Job, Topology, WorkflowEngine};

/// Connection settings for [`RestWorkflowEngine`].
#[derive(Debug, Clone)]
pub struct RestEngineConfig {
    /// `host:port`, or a full `http(s)://` URL.
    pub gateway_address: String,
    /// Transport security: `https` when no scheme is given.
    pub use_tls: bool,
    pub auth_token: Option<String>,
    pub request_timeout: Duration,
}

impl Default for RestEngineConfig {
    fn default() -> Self {
        Self {
            gateway_address: "localhost:8080".to_string(),
            use_tls: false,
            auth_token: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RestEngineConfig {
    pub fn base_url(&self) -> String {
        let addr = self.gateway_address.trim().trim_end_matches('/');
        if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_string()
        } else {
            let scheme = if self.use_tls { "https" } else { "http" };
            format!("{scheme}://{addr}")
        }
    }
}

/// Engine client over HTTP.
#[derive(Debug, Clone)]
pub struct RestWorkflowEngine {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    request_timeout: Duration,
}

impl RestWorkflowEngine {
    pub fn new(config: RestEngineConfig) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url(),
            auth_token: config.auth_token,
            request_timeout: config.request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base_url, path));
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, EngineError> {
        let response = builder
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND {
            Err(EngineError::NotFound(message))
        } else {
            Err(EngineError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<reqwest::Response, EngineError> {
        self.send(self.request(reqwest::Method::POST, path).json(body)).await
    }
}

/// Engine keys arrive as JSON numbers on older gateways and strings on newer ones.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireKey {
    Number(i64),
    Text(String),
}

impl WireKey {
    fn parse(&self) -> Result<i64, EngineError> {
        match self {
            WireKey::Number(n) => Ok(*n),
            WireKey::Text(s) => s
                .parse::<i64>()
                .map_err(|e| EngineError::Decode(format!("invalid key '{s}': {e}"))),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ActivateJobsBody<'a> {
    #[serde(rename = "type")]
    job_type: &'a str,
    worker: &'a str,
    timeout: u64,
    max_jobs_to_activate: u32,
    request_timeout: u64,
}

#[derive(Debug, Deserialize)]
struct ActivateJobsResponse {
    #[serde(default)]
    jobs: Vec<WireJob>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireJob {
    job_key: WireKey,
    #[serde(rename = "type")]
    job_type: String,
    process_instance_key: WireKey,
    #[serde(default)]
    bpmn_process_id: String,
    #[serde(default)]
    element_id: String,
    #[serde(default)]
    retries: i64,
    #[serde(default)]
    deadline: Option<i64>,
    #[serde(default)]
    variables: Variables,
    #[serde(default)]
    worker: String,
}

impl WireJob {
    fn into_job(self) -> Result<Job, EngineError> {
        Ok(Job {
            key: JobKey::new(self.job_key.parse()?),
            job_type: self.job_type,
            process_instance_key: ProcessInstanceKey::new(self.process_instance_key.parse()?),
            bpmn_process_id: self.bpmn_process_id,
            element_id: self.element_id,
            variables: self.variables,
            retries: u32::try_from(self.retries.max(0)).unwrap_or(u32::MAX),
            deadline: self.deadline.and_then(DateTime::<Utc>::from_timestamp_millis),
            worker: self.worker,
        })
    }
}

#[derive(Debug, Serialize)]
struct CompleteJobBody {
    variables: Variables,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FailJobBody<'a> {
    retries: u32,
    error_message: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishMessageBody<'a> {
    name: &'a str,
    correlation_key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_to_live: Option<u64>,
    variables: &'a Variables,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopologyResponse {
    #[serde(default)]
    brokers: Vec<WireBroker>,
    #[serde(default)]
    cluster_size: u32,
    #[serde(default)]
    partitions_count: u32,
    #[serde(default)]
    replication_factor: u32,
    #[serde(default)]
    gateway_version: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBroker {
    node_id: i32,
    host: String,
    port: u16,
    #[serde(default)]
    version: String,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl WorkflowEngine for RestWorkflowEngine {
    #[instrument(skip(self, request), fields(job_type = %request.job_type, max_jobs = request.max_jobs), err)]
    async fn activate_jobs(&self, request: &ActivateJobsRequest) -> Result<Vec<Job>, EngineError> {
        let body = ActivateJobsBody {
            job_type: &request.job_type,
            worker: &request.worker,
            timeout: millis(request.timeout),
            max_jobs_to_activate: request.max_jobs,
            request_timeout: millis(request.request_timeout.min(self.request_timeout)),
        };

        let response: ActivateJobsResponse = self
            .post("/v2/jobs/activation", &body)
            .await?
            .json()
            .await
            .map_err(|e| EngineError::Decode(e.to_string()))?;

        let jobs = response
            .jobs
            .into_iter()
            .map(WireJob::into_job)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = jobs.len(), "activated jobs");
        Ok(jobs)
    }

    async fn complete_job(&self, key: JobKey, variables: Variables) -> Result<(), EngineError> {
        self.post(&format!("/v2/jobs/{key}/completion"), &CompleteJobBody { variables })
            .await?;
        Ok(())
    }

    async fn fail_job(&self, key: JobKey, retries: u32, error_message: &str) -> Result<(), EngineError> {
        self.post(
            &format!("/v2/jobs/{key}/failure"),
            &FailJobBody {
                retries,
                error_message,
            },
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, message), fields(name = %message.name, correlation_key = %message.correlation_key), err)]
    async fn publish_message(&self, message: &CorrelationMessage) -> Result<(), EngineError> {
        let body = PublishMessageBody {
            name: &message.name,
            correlation_key: &message.correlation_key,
            time_to_live: message.time_to_live.map(millis),
            variables: &message.variables,
        };
        self.post("/v2/messages/publication", &body).await?;
        Ok(())
    }

    async fn cancel_instance(&self, key: ProcessInstanceKey) -> Result<(), EngineError> {
        self.post(
            &format!("/v2/process-instances/{key}/cancellation"),
            &serde_json::json!({}),
        )
        .await?;
        Ok(())
    }

    async fn topology(&self) -> Result<Topology, EngineError> {
        let response: TopologyResponse = self
            .send(self.request(reqwest::Method::GET, "/v2/topology"))
            .await?
            .json()
            .await
            .map_err(|e| EngineError::Decode(e.to_string()))?;

        Ok(Topology {
            brokers: response
                .brokers
                .into_iter()
                .map(|b| BrokerNode {
                    node_id: b.node_id,
                    host: b.host,
                    port: b.port,
                    version: b.version,
                })
                .collect(),
            cluster_size: response.cluster_size,
            partitions_count: response.partitions_count,
            replication_factor: response.replication_factor,
            gateway_version: response.gateway_version,
        })
    }
}
