//! Job tracking records and worker registration settings.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flowbridge_core::{JobKey, ProcessInstanceKey, Variables};

use crate::config::ConfigError;
use crate::engine::Job;

/// Last-known local state of a tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackedStatus {
    Active,
    Completed,
    Failed,
}

/// Local cache entry for a job awaiting completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveJob {
    pub job_key: JobKey,
    pub process_instance_key: ProcessInstanceKey,
    pub job_type: String,
    pub element_id: String,
    pub variables: Variables,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    pub status: TrackedStatus,
}

impl ActiveJob {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_key: job.key,
            process_instance_key: job.process_instance_key,
            job_type: job.job_type.clone(),
            element_id: job.element_id.clone(),
            variables: job.variables.clone(),
            retries: job.retries,
            created_at: Utc::now(),
            status: TrackedStatus::Active,
        }
    }
}

/// Per-type worker registration.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    pub job_type: String,
    /// Name reported to the engine on activation.
    pub worker_name: String,
    /// Bound on concurrently in-flight jobs of this type.
    pub max_active: usize,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    /// Complete the job after the handler returns `Ok`, or leave it to the handler.
    pub auto_complete: bool,
}

impl JobWorkerConfig {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            worker_name: "flowbridge".to_string(),
            max_active: 5,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(10),
            auto_complete: true,
        }
    }

    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    pub fn with_max_active(mut self, max: usize) -> Self {
        self.max_active = max;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_auto_complete(mut self, auto_complete: bool) -> Self {
        self.auto_complete = auto_complete;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job_type.trim().is_empty() {
            return Err(ConfigError::invalid("job_type", &self.job_type, "must not be blank"));
        }
        if self.max_active == 0 {
            return Err(ConfigError::invalid("max_active", "0", "must be at least 1"));
        }
        if self.job_timeout.is_zero() {
            return Err(ConfigError::invalid("job_timeout", "0", "must be positive"));
        }
        Ok(())
    }
}
