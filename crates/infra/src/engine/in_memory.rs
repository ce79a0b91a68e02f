//! In-memory workflow engine for tests/dev.
//!
//! Models only what the bridge relies on:
//! - per-type job queues with exclusive activation and reclaim after the job timeout
//! - retry bookkeeping, and an incident when a job is failed with `retries == 0`
//! - instances waiting on a named message with a correlation key
//! - idempotent resume: a message for an instance that already left the
//!   waiting state is accepted and changes nothing
//!
//! Every call is recorded so tests can assert on exactly what the bridge did.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use flowbridge_core::{JobKey, ProcessInstanceKey, Variables};

use super::{ActivateJobsRequest, BrokerNode, CorrelationMessage, EngineError, Job, Topology, WorkflowEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Activatable,
    Activated { until: Instant },
    Completed,
    Incident,
    Cancelled,
}

#[derive(Debug, Clone)]
struct StoredJob {
    job: Job,
    state: JobState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Active,
    Cancelled,
}

#[derive(Debug, Clone)]
struct Instance {
    state: InstanceState,
    variables: Variables,
    /// `(message name, correlation key)` of the receive step it waits on.
    waiting_for: Option<(String, String)>,
}

/// A recorded `fail_job` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureCall {
    pub job_key: JobKey,
    pub retries: u32,
    pub error_message: String,
}

/// Terminal job failure awaiting an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incident {
    pub job_key: JobKey,
    pub process_instance_key: ProcessInstanceKey,
    pub error_message: String,
}

#[derive(Debug, Default)]
struct State {
    jobs: BTreeMap<JobKey, StoredJob>,
    instances: HashMap<ProcessInstanceKey, Instance>,
    completions: Vec<(JobKey, Variables)>,
    failures: Vec<FailureCall>,
    publications: Vec<CorrelationMessage>,
    correlations: Vec<(ProcessInstanceKey, String)>,
    incidents: Vec<Incident>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    next_key: AtomicI64,
    rejected_publications: AtomicU32,
    unreachable: AtomicU32,
    publish_delay: Mutex<Option<Duration>>,
}

/// Fake engine. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryWorkflowEngine {
    shared: Arc<Shared>,
}

impl Default for InMemoryWorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWorkflowEngine {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                next_key: AtomicI64::new(2_251_799_813_685_249),
                rejected_publications: AtomicU32::new(0),
                unreachable: AtomicU32::new(0),
                publish_delay: Mutex::new(None),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_key(&self) -> i64 {
        self.shared.next_key.fetch_add(1, Ordering::SeqCst)
    }

    /// Start a process instance with the given variables.
    pub fn start_instance(&self, variables: Variables) -> ProcessInstanceKey {
        let key = ProcessInstanceKey::new(self.next_key());
        self.state().instances.insert(
            key,
            Instance {
                state: InstanceState::Active,
                variables,
                waiting_for: None,
            },
        );
        key
    }

    /// Offer a job of `job_type` for `instance` with `retries` attempts.
    pub fn create_job(
        &self,
        instance: ProcessInstanceKey,
        job_type: &str,
        element_id: &str,
        variables: Variables,
        retries: u32,
    ) -> JobKey {
        let key = JobKey::new(self.next_key());
        let mut state = self.state();
        let mut merged = state
            .instances
            .get(&instance)
            .map(|i| i.variables.clone())
            .unwrap_or_default();
        merged.extend(variables);

        state.jobs.insert(
            key,
            StoredJob {
                job: Job {
                    key,
                    job_type: job_type.to_string(),
                    process_instance_key: instance,
                    bpmn_process_id: "bridge-process".to_string(),
                    element_id: element_id.to_string(),
                    variables: merged,
                    retries,
                    deadline: None,
                    worker: String::new(),
                },
                state: JobState::Activatable,
            },
        );
        key
    }

    /// Park `instance` on a receive step for `message_name` / `correlation_key`.
    pub fn await_message(&self, instance: ProcessInstanceKey, message_name: &str, correlation_key: &str) {
        if let Some(i) = self.state().instances.get_mut(&instance) {
            i.waiting_for = Some((message_name.to_string(), correlation_key.to_string()));
        }
    }

    /// Reject the next `n` message publications with a 400.
    pub fn reject_next_publications(&self, n: u32) {
        self.shared.rejected_publications.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` calls of any kind fail with a transport error.
    pub fn fail_next_calls(&self, n: u32) {
        self.shared.unreachable.store(n, Ordering::SeqCst);
    }

    /// Delay every message publication (simulates a hung gateway).
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        *self.shared.publish_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn completions(&self) -> Vec<(JobKey, Variables)> {
        self.state().completions.clone()
    }

    pub fn failures(&self) -> Vec<FailureCall> {
        self.state().failures.clone()
    }

    pub fn publications(&self) -> Vec<CorrelationMessage> {
        self.state().publications.clone()
    }

    /// Instances actually resumed by a publication, with the correlation key used.
    pub fn correlations(&self) -> Vec<(ProcessInstanceKey, String)> {
        self.state().correlations.clone()
    }

    pub fn incidents(&self) -> Vec<Incident> {
        self.state().incidents.clone()
    }

    pub fn is_waiting(&self, instance: ProcessInstanceKey) -> bool {
        self.state()
            .instances
            .get(&instance)
            .is_some_and(|i| i.waiting_for.is_some())
    }

    pub fn instance_state(&self, instance: ProcessInstanceKey) -> Option<InstanceState> {
        self.state().instances.get(&instance).map(|i| i.state)
    }

    pub fn instance_variables(&self, instance: ProcessInstanceKey) -> Option<Variables> {
        self.state().instances.get(&instance).map(|i| i.variables.clone())
    }

    /// Current retry budget of a job as the engine sees it.
    pub fn job_retries(&self, key: JobKey) -> Option<u32> {
        self.state().jobs.get(&key).map(|j| j.job.retries)
    }

    fn take_outage(&self) -> Result<(), EngineError> {
        let hit = self
            .shared
            .unreachable
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            Err(EngineError::Transport("injected outage".to_string()))
        } else {
            Ok(())
        }
    }

    fn activated_job<'a>(state: &'a mut State, key: JobKey) -> Result<&'a mut StoredJob, EngineError> {
        let stored = state
            .jobs
            .get_mut(&key)
            .ok_or_else(|| EngineError::NotFound(format!("job {key}")))?;
        match stored.state {
            JobState::Activated { .. } => Ok(stored),
            other => Err(EngineError::Rejected {
                status: 409,
                message: format!("job {key} is not activated ({other:?})"),
            }),
        }
    }
}

#[async_trait]
impl WorkflowEngine for InMemoryWorkflowEngine {
    async fn activate_jobs(&self, request: &ActivateJobsRequest) -> Result<Vec<Job>, EngineError> {
        self.take_outage()?;

        let now = Instant::now();
        let deadline = Utc::now() + chrono::Duration::from_std(request.timeout).unwrap_or_default();
        let mut state = self.state();
        let mut activated = Vec::new();

        for stored in state.jobs.values_mut() {
            if activated.len() >= request.max_jobs as usize {
                break;
            }
            if stored.job.job_type != request.job_type {
                continue;
            }
            let available = match stored.state {
                JobState::Activatable => true,
                JobState::Activated { until } => until <= now,
                _ => false,
            };
            if !available {
                continue;
            }

            stored.state = JobState::Activated {
                until: now + request.timeout,
            };
            stored.job.deadline = Some(deadline);
            stored.job.worker = request.worker.clone();
            activated.push(stored.job.clone());
        }

        Ok(activated)
    }

    async fn complete_job(&self, key: JobKey, variables: Variables) -> Result<(), EngineError> {
        self.take_outage()?;

        let mut state = self.state();
        let stored = Self::activated_job(&mut state, key)?;
        stored.state = JobState::Completed;
        let instance_key = stored.job.process_instance_key;

        if let Some(instance) = state.instances.get_mut(&instance_key) {
            instance.variables.extend(variables.clone());
        }
        state.completions.push((key, variables));
        Ok(())
    }

    async fn fail_job(&self, key: JobKey, retries: u32, error_message: &str) -> Result<(), EngineError> {
        self.take_outage()?;

        let mut state = self.state();
        let stored = Self::activated_job(&mut state, key)?;
        stored.job.retries = retries;
        let instance_key = stored.job.process_instance_key;
        if retries == 0 {
            stored.state = JobState::Incident;
        } else {
            stored.state = JobState::Activatable;
        }

        state.failures.push(FailureCall {
            job_key: key,
            retries,
            error_message: error_message.to_string(),
        });
        if retries == 0 {
            state.incidents.push(Incident {
                job_key: key,
                process_instance_key: instance_key,
                error_message: error_message.to_string(),
            });
        }
        Ok(())
    }

    async fn publish_message(&self, message: &CorrelationMessage) -> Result<(), EngineError> {
        self.take_outage()?;

        let delay = *self.shared.publish_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let rejected = self
            .shared
            .rejected_publications
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(EngineError::Rejected {
                status: 400,
                message: "injected rejection".to_string(),
            });
        }

        let mut guard = self.state();
        let state = &mut *guard;
        state.publications.push(message.clone());

        let waiting = state.instances.iter_mut().find(|(_, i)| {
            i.state == InstanceState::Active
                && i.waiting_for
                    .as_ref()
                    .is_some_and(|(name, key)| *name == message.name && *key == message.correlation_key)
        });

        if let Some((key, instance)) = waiting {
            let key = *key;
            instance.waiting_for = None;
            instance.variables.extend(message.variables.clone());
            state.correlations.push((key, message.correlation_key.clone()));
        }
        Ok(())
    }

    async fn cancel_instance(&self, key: ProcessInstanceKey) -> Result<(), EngineError> {
        self.take_outage()?;

        let mut state = self.state();
        let instance = state
            .instances
            .get_mut(&key)
            .ok_or_else(|| EngineError::NotFound(format!("process instance {key}")))?;
        instance.state = InstanceState::Cancelled;
        instance.waiting_for = None;

        for stored in state.jobs.values_mut() {
            if stored.job.process_instance_key == key
                && !matches!(stored.state, JobState::Completed | JobState::Incident)
            {
                stored.state = JobState::Cancelled;
            }
        }
        Ok(())
    }

    async fn topology(&self) -> Result<Topology, EngineError> {
        self.take_outage()?;

        Ok(Topology {
            brokers: vec![BrokerNode {
                node_id: 0,
                host: "in-memory".to_string(),
                port: 26501,
                version: env!("CARGO_PKG_VERSION").to_string(),
            }],
            cluster_size: 1,
            partitions_count: 1,
            replication_factor: 1,
            gateway_version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}
