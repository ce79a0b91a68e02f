//! Correlation registry: which request ids this process has put on the wire.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use flowbridge_core::{JobKey, ProcessInstanceKey, RequestId};
use flowbridge_messaging::EnvelopeStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationRecord {
    pub request_id: RequestId,
    pub job_key: JobKey,
    pub process_instance_key: ProcessInstanceKey,
    pub status: EnvelopeStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// In-memory; nothing survives a restart.
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    records: RwLock<HashMap<RequestId, CorrelationRecord>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<RequestId, CorrelationRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<RequestId, CorrelationRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an outbound request as `pending`.
    ///
    /// Re-registering the same id (a retried job reusing its `requestId`)
    /// resets the record to `pending` and returns the record it replaced.
    pub fn register(
        &self,
        request_id: RequestId,
        job_key: JobKey,
        process_instance_key: ProcessInstanceKey,
    ) -> Option<CorrelationRecord> {
        let record = CorrelationRecord {
            request_id: request_id.clone(),
            job_key,
            process_instance_key,
            status: EnvelopeStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.write().insert(request_id, record)
    }

    /// Forget a request whose publish never happened.
    pub fn unregister(&self, request_id: &RequestId) {
        self.write().remove(request_id);
    }

    /// Put back a record replaced by [`register`](Self::register).
    pub fn restore(&self, record: CorrelationRecord) {
        self.write().insert(record.request_id.clone(), record);
    }

    /// Move a known request to its terminal status. Returns `None` for unknown ids.
    pub fn resolve(&self, request_id: &RequestId, status: EnvelopeStatus) -> Option<CorrelationRecord> {
        let mut records = self.write();
        let record = records.get_mut(request_id)?;
        record.status = status;
        record.resolved_at.get_or_insert_with(Utc::now);
        Some(record.clone())
    }

    pub fn lookup(&self, request_id: &RequestId) -> Option<CorrelationRecord> {
        self.read().get(request_id).cloned()
    }

    /// Evict terminal records resolved more than `resolved_for` ago, and
    /// pending records registered more than `pending_for` ago whose response
    /// never arrived. Returns how many were evicted.
    pub fn prune(&self, resolved_for: Duration, pending_for: Duration) -> usize {
        let now = Utc::now();
        let (Some(resolved_cutoff), Some(pending_cutoff)) = (cutoff(now, resolved_for), cutoff(now, pending_for)) else {
            return 0;
        };
        let mut records = self.write();
        let before = records.len();
        records.retain(|_, r| match r.resolved_at {
            Some(at) if r.status.is_terminal() => at > resolved_cutoff,
            _ => r.created_at > pending_cutoff,
        });
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn pending(&self) -> usize {
        self.read().values().filter(|r| !r.status.is_terminal()).count()
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(age).ok().and_then(|age| now.checked_sub_signed(age))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> RequestId {
        RequestId::parse(s).unwrap()
    }

    #[test]
    fn registered_requests_resolve_to_terminal_status() {
        let registry = CorrelationRegistry::new();
        registry.register(id("r1"), JobKey::new(1), ProcessInstanceKey::new(10));
        assert_eq!(registry.pending(), 1);

        let record = registry.resolve(&id("r1"), EnvelopeStatus::Succeeded).unwrap();
        assert_eq!(record.status, EnvelopeStatus::Succeeded);
        assert!(record.resolved_at.is_some());
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn unknown_requests_do_not_resolve() {
        let registry = CorrelationRegistry::new();
        assert!(registry.resolve(&id("nope"), EnvelopeStatus::Failed).is_none());
        assert!(registry.lookup(&id("nope")).is_none());
    }

    #[test]
    fn resolving_twice_keeps_first_resolution_time() {
        let registry = CorrelationRegistry::new();
        registry.register(id("r1"), JobKey::new(1), ProcessInstanceKey::new(10));
        let first = registry.resolve(&id("r1"), EnvelopeStatus::Failed).unwrap();
        let second = registry.resolve(&id("r1"), EnvelopeStatus::Failed).unwrap();
        assert_eq!(first.resolved_at, second.resolved_at);
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn prune_evicts_resolved_records_before_pending_ones() {
        let registry = CorrelationRegistry::new();
        registry.register(id("done"), JobKey::new(1), ProcessInstanceKey::new(10));
        registry.register(id("waiting"), JobKey::new(2), ProcessInstanceKey::new(11));
        registry.resolve(&id("done"), EnvelopeStatus::Succeeded);

        assert_eq!(registry.prune(Duration::ZERO, HOUR), 1);
        assert!(registry.lookup(&id("done")).is_none());
        assert!(registry.lookup(&id("waiting")).is_some());
    }

    #[test]
    fn prune_keeps_recently_resolved_records() {
        let registry = CorrelationRegistry::new();
        registry.register(id("r1"), JobKey::new(1), ProcessInstanceKey::new(10));
        registry.resolve(&id("r1"), EnvelopeStatus::Succeeded);
        assert_eq!(registry.prune(HOUR, HOUR), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn prune_evicts_pending_records_whose_response_never_arrived() {
        let registry = CorrelationRegistry::new();
        for n in 0..1000 {
            registry.register(id(&format!("r{n}")), JobKey::new(n), ProcessInstanceKey::new(10));
        }

        assert_eq!(registry.prune(HOUR, HOUR), 0);
        assert_eq!(registry.prune(HOUR, Duration::ZERO), 1000);
        assert!(registry.is_empty());
    }

    #[test]
    fn reregistering_returns_the_replaced_record_for_restore() {
        let registry = CorrelationRegistry::new();
        registry.register(id("r1"), JobKey::new(1), ProcessInstanceKey::new(10));
        assert!(registry.resolve(&id("r1"), EnvelopeStatus::Succeeded).is_some());

        let previous = registry.register(id("r1"), JobKey::new(2), ProcessInstanceKey::new(10)).unwrap();
        assert_eq!(registry.lookup(&id("r1")).unwrap().status, EnvelopeStatus::Pending);

        registry.restore(previous);
        let record = registry.lookup(&id("r1")).unwrap();
        assert_eq!(record.status, EnvelopeStatus::Succeeded);
        assert_eq!(record.job_key, JobKey::new(1));
    }

    #[test]
    fn unregister_forgets_the_request() {
        let registry = CorrelationRegistry::new();
        registry.register(id("r1"), JobKey::new(1), ProcessInstanceKey::new(10));
        registry.unregister(&id("r1"));
        assert!(registry.is_empty());
    }
}
