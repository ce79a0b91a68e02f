//! Request DTOs for the job endpoints.

use serde::Deserialize;

use flowbridge_core::Variables;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsQuery {
    pub process_instance_key: Option<i64>,
    pub job_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompleteJobRequest {
    #[serde(default)]
    pub variables: Variables,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailJobQuery {
    pub error_message: Option<String>,
    /// Remaining retries to report; defaults to the tracked job's budget minus one.
    pub retries: Option<u32>,
}
