//! Small job handlers around the bridge: id minting and response logging.

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use flowbridge_core::{BridgeError, RequestId, Variables};

use crate::engine::Job;
use crate::jobs::{JobClient, JobHandler};

pub const GENERATE_REQUEST_ID: &str = "generate-request-id";
pub const SUCCESS_HANDLER: &str = "success-handler";
pub const ERROR_HANDLER: &str = "error-handler";

/// Mints the request id once, before the outbound step runs.
#[derive(Debug, Default)]
pub struct GenerateRequestId;

#[async_trait]
impl JobHandler for GenerateRequestId {
    async fn handle(&self, job: Job, _client: JobClient) -> Result<Variables, BridgeError> {
        let request_id = RequestId::generate();
        info!(job_key = %job.key, request_id = %request_id, "minted request id");

        let mut out = Variables::new();
        out.insert("requestId".to_string(), json!(request_id.as_str()));
        Ok(out)
    }
}

/// Which branch of the receive step a [`ResponseLogger`] sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
}

/// Logs the `response` variable written by the inbound bridge and completes.
///
/// Always completes, even when the variable is missing or unreadable, so a
/// garbled response can never spin the job into a failure loop.
#[derive(Debug)]
pub struct ResponseLogger {
    outcome: Outcome,
}

impl ResponseLogger {
    pub fn new(outcome: Outcome) -> Self {
        Self { outcome }
    }
}

#[async_trait]
impl JobHandler for ResponseLogger {
    async fn handle(&self, job: Job, _client: JobClient) -> Result<Variables, BridgeError> {
        let response = job.variables.get("response").cloned().unwrap_or(JsonValue::Null);
        let request_id = job
            .variables
            .get("requestId")
            .and_then(JsonValue::as_str)
            .unwrap_or("<none>");

        match self.outcome {
            Outcome::Success => {
                info!(job_key = %job.key, request_id, response = %response, "request succeeded");
            }
            Outcome::Error => {
                let detail = response
                    .get("detail")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("no detail");
                warn!(job_key = %job.key, request_id, detail, "request failed");
            }
        }

        let mut out = Variables::new();
        out.insert("handled".to_string(), json!(true));
        Ok(out)
    }
}
