//! Job tracking store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};

use flowbridge_core::{JobKey, ProcessInstanceKey};

use super::types::{ActiveJob, TrackedStatus};

/// Registry of jobs currently held by this process, keyed by job key.
///
/// Queries return snapshot copies ordered by job key, never live views.
/// Lookups that find nothing are a normal outcome: the job may already have
/// been completed and evicted.
pub trait JobTrackingStore: Send + Sync {
    /// Insert or overwrite.
    fn add(&self, job: ActiveJob);

    /// No-op when absent.
    fn remove(&self, job_key: JobKey);

    fn get(&self, job_key: JobKey) -> Option<ActiveJob>;

    fn by_process_instance(&self, process_instance_key: ProcessInstanceKey) -> Vec<ActiveJob>;

    fn by_type(&self, job_type: &str) -> Vec<ActiveJob>;

    fn all(&self) -> Vec<ActiveJob>;

    /// Silently does nothing when the job is not tracked.
    fn update_status(&self, job_key: JobKey, status: TrackedStatus);
}

impl<S> JobTrackingStore for Arc<S>
where
    S: JobTrackingStore + ?Sized,
{
    fn add(&self, job: ActiveJob) {
        (**self).add(job)
    }

    fn remove(&self, job_key: JobKey) {
        (**self).remove(job_key)
    }

    fn get(&self, job_key: JobKey) -> Option<ActiveJob> {
        (**self).get(job_key)
    }

    fn by_process_instance(&self, process_instance_key: ProcessInstanceKey) -> Vec<ActiveJob> {
        (**self).by_process_instance(process_instance_key)
    }

    fn by_type(&self, job_type: &str) -> Vec<ActiveJob> {
        (**self).by_type(job_type)
    }

    fn all(&self) -> Vec<ActiveJob> {
        (**self).all()
    }

    fn update_status(&self, job_key: JobKey, status: TrackedStatus) {
        (**self).update_status(job_key, status)
    }
}

/// In-memory tracking store. Lock hold times are a map operation; no I/O
/// ever happens under the lock.
#[derive(Debug, Default)]
pub struct InMemoryJobTrackingStore {
    jobs: RwLock<HashMap<JobKey, ActiveJob>>,
}

impl InMemoryJobTrackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobKey, ActiveJob>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobKey, ActiveJob>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, keep: impl Fn(&ActiveJob) -> bool) -> Vec<ActiveJob> {
        let mut jobs: Vec<_> = self.read().values().filter(|j| keep(j)).cloned().collect();
        jobs.sort_by_key(|j| j.job_key);
        jobs
    }
}

impl JobTrackingStore for InMemoryJobTrackingStore {
    fn add(&self, job: ActiveJob) {
        self.write().insert(job.job_key, job);
    }

    fn remove(&self, job_key: JobKey) {
        self.write().remove(&job_key);
    }

    fn get(&self, job_key: JobKey) -> Option<ActiveJob> {
        self.read().get(&job_key).cloned()
    }

    fn by_process_instance(&self, process_instance_key: ProcessInstanceKey) -> Vec<ActiveJob> {
        self.snapshot(|j| j.process_instance_key == process_instance_key)
    }

    fn by_type(&self, job_type: &str) -> Vec<ActiveJob> {
        self.snapshot(|j| j.job_type == job_type)
    }

    fn all(&self) -> Vec<ActiveJob> {
        self.snapshot(|_| true)
    }

    fn update_status(&self, job_key: JobKey, status: TrackedStatus) {
        if let Some(job) = self.write().get_mut(&job_key) {
            job.status = status;
        }
    }
}
