//! In-process queue for tests and single-node development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use auditflow_core::{Clock, ExternalRef, Job, RecordId, SystemClock};

use super::provider::{QueueError, QueueProvider};
use super::record::{LeasePolicy, LeaseRecord, LeasedJob};

const BACKEND: &str = "memory";

#[derive(Debug, Default)]
struct Records {
    by_id: HashMap<RecordId, (u64, LeaseRecord)>,
    next_seq: u64,
}

/// Mutex-guarded in-memory queue.
///
/// Selection and update happen under one lock, which is the whole atomicity
/// story. Records enqueued at the same instant are ordered by insertion.
#[derive(Debug)]
pub struct InMemoryQueue {
    records: Mutex<Records>,
    policy: LeasePolicy,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(Records::default()),
            policy: LeasePolicy::default(),
            clock,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_policy(mut self, policy: LeasePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored records, dead ones included.
    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of a stored record, for inspection.
    pub fn record(&self, external_ref: &ExternalRef) -> Option<LeaseRecord> {
        let id = external_ref.as_str().parse::<RecordId>().ok()?;
        self.lock().by_id.get(&id).map(|(_, rec)| rec.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Records> {
        // Every mutation completes before the guard drops, so a poisoned map is consistent.
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::fatal(BACKEND, "queue is closed"));
        }
        Ok(())
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueProvider for InMemoryQueue {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn enqueue(&self, job: &Job) -> Result<ExternalRef, QueueError> {
        self.ensure_open()?;
        let record = LeaseRecord::new(job.clone(), &self.policy, self.clock.now());
        let external_ref = record.external_ref();

        let mut records = self.lock();
        let seq = records.next_seq;
        records.next_seq += 1;
        records.by_id.insert(record.id, (seq, record));

        debug!(backend = BACKEND, external_ref = %external_ref, "job enqueued");
        Ok(external_ref)
    }

    fn lease_next(&self) -> Result<Option<LeasedJob>, QueueError> {
        self.ensure_open()?;
        let now = self.clock.now();
        let mut records = self.lock();

        let next = records
            .by_id
            .values()
            .filter(|(_, rec)| rec.is_eligible(now))
            .min_by_key(|(seq, rec)| (rec.lease_order(), *seq))
            .map(|(_, rec)| rec.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some((_, record)) = records.by_id.get_mut(&id) else {
            return Ok(None);
        };

        record.lease(now, &self.policy);
        Ok(Some(record.to_leased()))
    }

    fn delete(&self, external_ref: &ExternalRef) -> Result<(), QueueError> {
        self.ensure_open()?;
        let id = external_ref
            .as_str()
            .parse::<RecordId>()
            .map_err(|e| QueueError::fatal(BACKEND, e.to_string()))?;
        self.lock().by_id.remove(&id);
        Ok(())
    }

    fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
