//! Redis-backed lease queue (feature `redis`).
//!
//! ## Layout
//!
//! - `{prefix}:record:{id}`: the lease record as JSON
//! - `{prefix}:index`: sorted set of leasable records, score = `lock_until` in
//!   microseconds, member = `{created:020}:{id}` so equal scores fall back to age
//!
//! Dead records leave the index but keep their JSON until deleted.
//!
//! ## Atomicity
//!
//! Leasing is an optimistic transaction: `WATCH index`, read the head of the
//! index and its record, then `MULTI` / `SET` / `ZADD|ZREM` / `EXEC`. Every write
//! to a leasable record also touches the index, so a competing lease, enqueue or
//! delete aborts the `EXEC` and the attempt is retried.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use redis::{Commands, ErrorKind, RedisError};
use tracing::{debug, instrument, warn};

use auditflow_core::{Clock, ExternalRef, Job, RecordId, SystemClock};

use super::DEFAULT_KEY_PREFIX;
use super::provider::{ErrorClass, QueueError, QueueProvider};
use super::record::{LeasePolicy, LeaseRecord, LeasedJob};

const BACKEND: &str = "redis";

#[derive(Debug, Clone)]
pub struct RedisQueue {
    client: Arc<redis::Client>,
    prefix: String,
    policy: LeasePolicy,
    clock: Arc<dyn Clock>,
}

impl RedisQueue {
    /// Create a queue against `redis_url` (e.g. `redis://localhost:6379`).
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> Result<Self, QueueError> {
        let client =
            redis::Client::open(redis_url.as_ref()).map_err(|e| map_redis_error("open", e))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            policy: LeasePolicy::default(),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_policy(mut self, policy: LeasePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn index_key(&self) -> String {
        format!("{}:index", self.prefix)
    }

    fn record_key(&self, id: &str) -> String {
        format!("{}:record:{id}", self.prefix)
    }

    fn connection(&self, operation: &str) -> Result<redis::Connection, QueueError> {
        self.client
            .get_connection()
            .map_err(|e| map_redis_error(operation, e))
    }

    /// Remove every key under this queue's prefix.
    pub fn purge(&self) -> Result<(), QueueError> {
        let mut conn = self.connection("purge")?;
        let keys: Vec<String> = conn
            .scan_match::<_, String>(format!("{}:*", self.prefix))
            .map_err(|e| map_redis_error("purge", e))?
            .collect();
        if !keys.is_empty() {
            conn.del::<_, ()>(keys)
                .map_err(|e| map_redis_error("purge", e))?;
        }
        Ok(())
    }
}

impl QueueProvider for RedisQueue {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    #[instrument(skip(self, job), fields(prefix = %self.prefix, title = %job.title), err)]
    fn enqueue(&self, job: &Job) -> Result<ExternalRef, QueueError> {
        let record = LeaseRecord::new(job.clone(), &self.policy, self.clock.now());
        let payload = serde_json::to_string(&record)
            .map_err(|e| QueueError::fatal(BACKEND, format!("failed to encode record: {e}")))?;
        let id = record.id.to_string();

        let mut conn = self.connection("enqueue")?;
        let mut pipe = redis::pipe();
        pipe.atomic().set(self.record_key(&id), payload).ignore();
        if record.retry_available {
            pipe.zadd(self.index_key(), index_member(&record), score(record.lock_until))
                .ignore();
        }
        pipe.query::<()>(&mut conn)
            .map_err(|e| map_redis_error("enqueue", e))?;

        Ok(record.external_ref())
    }

    #[instrument(skip(self), fields(prefix = %self.prefix), err)]
    fn lease_next(&self) -> Result<Option<LeasedJob>, QueueError> {
        let now = self.clock.now();
        let policy = self.policy;
        let index = self.index_key();
        let mut conn = self.connection("lease_next")?;

        let leased = redis::transaction(&mut conn, &[index.as_str()], |conn, pipe| {
            let head: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(&index)
                .arg("-inf")
                .arg(format!("({}", score(now)))
                .arg("LIMIT")
                .arg(0)
                .arg(1)
                .query(conn)?;
            let Some(member) = head.into_iter().next() else {
                return Ok(Some(None));
            };

            let id = member.rsplit_once(':').map(|(_, id)| id).unwrap_or(member.as_str());
            let key = self.record_key(id);
            let raw: Option<String> = conn.get(&key)?;

            let Some(raw) = raw else {
                // Index entry whose record was deleted underneath it.
                pipe.zrem(&index, &member).ignore();
                let committed: Option<()> = pipe.query(conn)?;
                return Ok(committed.map(|()| None));
            };

            let mut record: LeaseRecord = serde_json::from_str(&raw).map_err(corrupt_record)?;
            if !record.is_eligible(now) {
                return Ok(Some(None));
            }
            record.lease(now, &policy);
            let payload = serde_json::to_string(&record).map_err(corrupt_record)?;

            pipe.set(&key, payload).ignore();
            if record.retry_available {
                pipe.zadd(&index, &member, score(record.lock_until)).ignore();
            } else {
                pipe.zrem(&index, &member).ignore();
            }
            let committed: Option<()> = pipe.query(conn)?;
            Ok(committed.map(|()| Some(record.to_leased())))
        })
        .map_err(|e| map_redis_error("lease_next", e))?;

        if let Some(job) = &leased {
            debug!(external_ref = %job.external_ref, retries_remaining = job.retries_remaining, "record leased");
        }
        Ok(leased)
    }

    #[instrument(skip(self), fields(prefix = %self.prefix), err)]
    fn delete(&self, external_ref: &ExternalRef) -> Result<(), QueueError> {
        let id = external_ref
            .as_str()
            .parse::<RecordId>()
            .map_err(|e| QueueError::fatal(BACKEND, e.to_string()))?
            .to_string();
        let key = self.record_key(&id);
        let mut conn = self.connection("delete")?;

        let raw: Option<String> = conn.get(&key).map_err(|e| map_redis_error("delete", e))?;
        let Some(raw) = raw else {
            return Ok(());
        };

        let mut pipe = redis::pipe();
        pipe.atomic().del(&key).ignore();
        match serde_json::from_str::<LeaseRecord>(&raw) {
            Ok(record) => {
                pipe.zrem(self.index_key(), index_member(&record)).ignore();
            }
            Err(e) => warn!(key = %key, error = %e, "deleting undecodable record"),
        }
        pipe.query::<()>(&mut conn)
            .map_err(|e| map_redis_error("delete", e))?;
        Ok(())
    }

    fn close(&self) -> Result<(), QueueError> {
        // Connections are opened per call; nothing is held between calls.
        Ok(())
    }
}

fn score(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn index_member(record: &LeaseRecord) -> String {
    format!("{:020}:{}", score(record.created).max(0), record.id)
}

fn corrupt_record(err: serde_json::Error) -> RedisError {
    RedisError::from((ErrorKind::TypeError, "corrupt lease record", err.to_string()))
}

/// Classify a redis error.
pub fn classify_redis_error(err: &RedisError) -> ErrorClass {
    if err.code() == Some("OOM") || err.to_string().starts_with("OOM") {
        return ErrorClass::QuotaExceeded;
    }
    if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() {
        return ErrorClass::Transient;
    }
    match err.kind() {
        ErrorKind::TryAgain
        | ErrorKind::BusyLoadingError
        | ErrorKind::ClusterDown
        | ErrorKind::MasterDown
        | ErrorKind::IoError => ErrorClass::Transient,
        _ => ErrorClass::Fatal,
    }
}

fn map_redis_error(operation: &str, err: RedisError) -> QueueError {
    QueueError::classified(
        classify_redis_error(&err),
        BACKEND,
        format!("redis error in {operation}: {err}"),
    )
}

/// Prefix unique to one test run.
#[cfg(any(test, feature = "testing"))]
pub fn scratch_prefix() -> String {
    format!("auditflow:test:{}", uuid::Uuid::now_v7().simple())
}
