//! Job poll & lifecycle manager.
//!
//! One [`JobWorker`] per registered job type. Each worker runs a single poll
//! loop that activates at most `max_active` outstanding jobs, fans handler
//! invocations out onto a `JoinSet`, and reports every outcome back to the
//! engine through a [`JobClient`].
//!
//! Outcomes:
//! - handler `Ok` + `auto_complete` → complete with the returned variables
//! - handler `Ok` without `auto_complete` → job stays tracked as `Active` until
//!   someone calls [`JobClient::complete`] / [`JobClient::fail`]
//! - handler `Err` → fail with `retries - 1` (never below zero)
//! - handler panics → fail with `retries - 1` and the panic message
//! - handler exceeds `job_timeout` → abandoned; the engine reclaims the job
//!
//! Shutdown is cooperative via a `CancellationToken`: the loop stops
//! activating, drains in-flight handlers (each bounded by its own timeout),
//! then exits. [`WorkerHandle::shutdown`] bounds the whole drain with a
//! grace period and aborts whatever is left.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowbridge_core::{BridgeError, JobKey, Variables};

use crate::config::ConfigError;
use crate::engine::{ActivateJobsRequest, Job, WorkflowEngine};
use crate::workers::WorkerHandle;

use super::store::JobTrackingStore;
use super::types::{ActiveJob, JobWorkerConfig, TrackedStatus};

/// Work performed for one activated job.
///
/// Returning `Ok(vars)` yields the output variables; returning `Err` fails the
/// job with a decremented retry budget and the error text as reason.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job, client: JobClient) -> Result<Variables, BridgeError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job, JobClient) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Variables, BridgeError>> + Send,
{
    async fn handle(&self, job: Job, client: JobClient) -> Result<Variables, BridgeError> {
        (self)(job, client).await
    }
}

/// Completion/failure callback handed to handlers and to the query surface.
///
/// Keeps the tracking store in step with what the engine was told.
#[derive(Clone)]
pub struct JobClient {
    engine: Arc<dyn WorkflowEngine>,
    store: Arc<dyn JobTrackingStore>,
}

impl core::fmt::Debug for JobClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobClient").finish_non_exhaustive()
    }
}

impl JobClient {
    pub fn new(engine: Arc<dyn WorkflowEngine>, store: Arc<dyn JobTrackingStore>) -> Self {
        Self { engine, store }
    }

    pub fn engine(&self) -> &Arc<dyn WorkflowEngine> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn JobTrackingStore> {
        &self.store
    }

    /// Complete `job_key`, then evict it from the tracking store.
    ///
    /// On engine error the tracked record is left untouched so the call can be retried.
    pub async fn complete(&self, job_key: JobKey, variables: Variables) -> Result<(), BridgeError> {
        self.engine.complete_job(job_key, variables).await?;
        self.store.update_status(job_key, TrackedStatus::Completed);
        self.store.remove(job_key);
        debug!(job_key = %job_key, "job completed");
        Ok(())
    }

    /// Fail `job_key` with an explicit remaining retry budget.
    pub async fn fail(&self, job_key: JobKey, retries: u32, error_message: &str) -> Result<(), BridgeError> {
        self.engine.fail_job(job_key, retries, error_message).await?;
        self.store.update_status(job_key, TrackedStatus::Failed);
        self.store.remove(job_key);

        if retries == 0 {
            let exhausted = BridgeError::retries_exhausted(job_key, error_message);
            error!(job_key = %job_key, error = %exhausted, "job failed with no retries left, engine raises an incident");
        } else {
            debug!(job_key = %job_key, retries, "job failed, engine will retry");
        }
        Ok(())
    }

    /// Fail a job that was activated in this process, decrementing its retries by one.
    pub async fn fail_attempt(&self, job: &Job, error_message: &str) -> Result<(), BridgeError> {
        self.fail(job.key, job.retries_after_failure(), error_message).await
    }
}

/// Spawns poll loops.
pub struct JobWorker;

impl JobWorker {
    /// Validate `config` and start its poll loop on the current runtime.
    pub fn spawn(
        config: JobWorkerConfig,
        client: JobClient,
        handler: Arc<dyn JobHandler>,
        token: CancellationToken,
    ) -> Result<WorkerHandle, ConfigError> {
        config.validate()?;

        let name = config.job_type.clone();
        let loop_token = token.clone();
        let join = tokio::spawn(async move {
            poll_loop(config, client, handler, loop_token).await;
        });

        Ok(WorkerHandle::new(name, token, join))
    }

    /// Validate every registration before spawning any of them.
    pub fn spawn_all(
        registrations: Vec<(JobWorkerConfig, Arc<dyn JobHandler>)>,
        client: &JobClient,
        token: &CancellationToken,
    ) -> Result<Vec<WorkerHandle>, ConfigError> {
        for (config, _) in &registrations {
            config.validate()?;
        }

        registrations
            .into_iter()
            .map(|(config, handler)| Self::spawn(config, client.clone(), handler, token.child_token()))
            .collect()
    }
}

async fn poll_loop(
    config: JobWorkerConfig,
    client: JobClient,
    handler: Arc<dyn JobHandler>,
    token: CancellationToken,
) {
    info!(
        worker = %config.worker_name,
        job_type = %config.job_type,
        max_active = config.max_active,
        "job worker started"
    );

    let permits = Arc::new(Semaphore::new(config.max_active));
    let mut in_flight: JoinSet<()> = JoinSet::new();

    loop {
        if token.is_cancelled() {
            break;
        }
        reap(&mut in_flight, &config.job_type);

        let available = permits.available_permits();
        if available == 0 {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                done = in_flight.join_next() => {
                    if let Some(Err(e)) = done {
                        log_join_error(&config.job_type, e);
                    }
                    continue;
                }
            }
        }

        let request = ActivateJobsRequest {
            job_type: config.job_type.clone(),
            worker: config.worker_name.clone(),
            max_jobs: u32::try_from(available).unwrap_or(u32::MAX),
            timeout: config.job_timeout,
            request_timeout: config.poll_interval,
        };

        let polled_at = tokio::time::Instant::now();
        let activated = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = client.engine().activate_jobs(&request) => result,
        };

        match activated {
            Ok(jobs) if !jobs.is_empty() => {
                debug!(job_type = %config.job_type, count = jobs.len(), "activated jobs");
                for job in jobs {
                    let Ok(permit) = permits.clone().acquire_owned().await else {
                        break;
                    };
                    client.store().add(ActiveJob::from_job(&job));
                    in_flight.spawn(run_job(
                        job,
                        handler.clone(),
                        client.clone(),
                        config.clone(),
                        permit,
                    ));
                }
            }
            // The activation call already long-polled; only wait out what is left of the interval.
            Ok(_) => idle(&token, config.poll_interval.saturating_sub(polled_at.elapsed())).await,
            Err(e) => {
                warn!(job_type = %config.job_type, error = %e, "job activation failed");
                idle(&token, config.poll_interval).await;
            }
        }
    }

    if !in_flight.is_empty() {
        info!(job_type = %config.job_type, in_flight = in_flight.len(), "draining in-flight jobs");
    }
    while let Some(done) = in_flight.join_next().await {
        if let Err(e) = done {
            log_join_error(&config.job_type, e);
        }
    }

    info!(worker = %config.worker_name, job_type = %config.job_type, "job worker stopped");
}

async fn idle(token: &CancellationToken, interval: Duration) {
    tokio::select! {
        biased;
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(interval) => {}
    }
}

fn reap(in_flight: &mut JoinSet<()>, job_type: &str) {
    while let Some(done) = in_flight.try_join_next() {
        if let Err(e) = done {
            log_join_error(job_type, e);
        }
    }
}

fn log_join_error(job_type: &str, e: tokio::task::JoinError) {
    if e.is_panic() {
        error!(job_type = %job_type, "job task panicked");
    }
}

async fn run_job(
    job: Job,
    handler: Arc<dyn JobHandler>,
    client: JobClient,
    config: JobWorkerConfig,
    _permit: OwnedSemaphorePermit,
) {
    let job_key = job.key;
    let retries = job.retries_after_failure();
    debug!(job_key = %job_key, job_type = %job.job_type, retries = job.retries, "handling job");

    // The handler runs in its own task so a panic surfaces as a `JoinError`.
    // Dropping the set aborts the attempt on timeout.
    let mut attempt = JoinSet::new();
    let handler_client = client.clone();
    attempt.spawn(async move { handler.handle(job, handler_client).await });

    match tokio::time::timeout(config.job_timeout, attempt.join_next()).await {
        Ok(Some(Ok(Ok(variables)))) if config.auto_complete => {
            if let Err(e) = client.complete(job_key, variables).await {
                warn!(job_key = %job_key, error = %e, "failed to complete job, engine will reclaim it");
                client.store().remove(job_key);
            }
        }
        Ok(Some(Ok(Ok(_)))) => {
            debug!(job_key = %job_key, "handler finished, awaiting manual completion");
        }
        Ok(Some(Ok(Err(err)))) => {
            warn!(job_key = %job_key, kind = err.kind(), error = %err, "job handler failed");
            report_failure(&client, job_key, retries, &err.to_string()).await;
        }
        Ok(Some(Err(join))) if join.is_panic() => {
            let reason = format!("job handler panicked: {}", panic_message(join.into_panic()));
            error!(job_key = %job_key, error = %reason, "job handler panicked");
            report_failure(&client, job_key, retries, &reason).await;
        }
        Ok(Some(Err(_)) | None) => {
            warn!(job_key = %job_key, "job handler was cancelled, leaving job to be reclaimed");
            client.store().remove(job_key);
        }
        Err(_) => {
            warn!(
                job_key = %job_key,
                timeout_ms = config.job_timeout.as_millis() as u64,
                "job handler timed out, leaving job to be reclaimed"
            );
            client.store().remove(job_key);
        }
    }
}

async fn report_failure(client: &JobClient, job_key: JobKey, retries: u32, reason: &str) {
    if let Err(e) = client.fail(job_key, retries, reason).await {
        warn!(job_key = %job_key, error = %e, "failed to report job failure, engine will reclaim it");
        client.store().remove(job_key);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|message| (*message).to_string())
            .unwrap_or_else(|| "non-string panic payload".to_string()),
    }
}
