//! Lease records and the lease arithmetic every backend shares.
//!
//! ```text
//!            lease (budget > 1)           lock_until elapses
//! Pending ───────────────────► Leased ─────────────────────► Pending
//!    │                           │
//!    │ lease (budget == 1)       │ delete
//!    ▼                           ▼
//!  Dead* ◄──────────────────  Deleted
//! ```
//!
//! `*` A record whose last lease used up the budget keeps its lock until it
//! expires, then sits as `Dead`: never eligible again. Backends differ only in
//! how they make "pick + [`LeaseRecord::lease`] + write back" atomic.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use auditflow_core::{ExternalRef, Job, RecordId};

/// Leases granted before a record goes dead.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// How long a lease hides a record from other workers.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(10 * 60);

/// Status stored on new records. Informational only.
pub const STATUS_PENDING: &str = "pending";

/// Retry budget and lock length applied by a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    pub retry_attempts: u32,
    pub lock_duration: Duration,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            lock_duration: DEFAULT_LOCK_DURATION,
        }
    }
}

impl LeasePolicy {
    pub fn new(retry_attempts: u32, lock_duration: Duration) -> Self {
        Self {
            retry_attempts,
            lock_duration,
        }
    }

    fn lock_delta(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lock_duration).unwrap_or(chrono::Duration::MAX)
    }
}

/// Where a record currently sits in the lease lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Pending,
    Leased,
    Dead,
    Deleted,
}

/// A queued job plus its lease metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub id: RecordId,
    pub created: DateTime<Utc>,
    pub lock_until: DateTime<Utc>,
    pub retries_remaining: u32,
    pub retry_available: bool,
    pub status: String,
    pub message: Job,
}

impl LeaseRecord {
    /// Fresh record: full budget, unlocked since the epoch.
    pub fn new(message: Job, policy: &LeasePolicy, now: DateTime<Utc>) -> Self {
        Self {
            id: RecordId::new(),
            created: now,
            lock_until: DateTime::<Utc>::UNIX_EPOCH,
            retries_remaining: policy.retry_attempts,
            retry_available: policy.retry_attempts > 0,
            status: STATUS_PENDING.to_string(),
            message: message.without_external_ref(),
        }
    }

    /// Whether `lease_next` may pick this record at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.retry_available && self.lock_until < now
    }

    pub fn state(&self, now: DateTime<Utc>) -> LeaseState {
        if self.lock_until >= now {
            LeaseState::Leased
        } else if self.retry_available {
            LeaseState::Pending
        } else {
            LeaseState::Dead
        }
    }

    /// Sort key: earliest lock first, then oldest.
    pub fn lease_order(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.lock_until, self.created)
    }

    /// Spend one unit of budget and lock the record until `now + lock_duration`.
    ///
    /// Callers must have checked [`LeaseRecord::is_eligible`] inside the same
    /// atomic section.
    pub fn lease(&mut self, now: DateTime<Utc>, policy: &LeasePolicy) {
        self.retries_remaining = self.retries_remaining.saturating_sub(1);
        self.retry_available = self.retries_remaining > 0;
        self.lock_until = now.checked_add_signed(policy.lock_delta()).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    pub fn external_ref(&self) -> ExternalRef {
        ExternalRef::from(self.id)
    }

    /// What the caller of `lease_next` gets back.
    pub fn to_leased(&self) -> LeasedJob {
        let external_ref = self.external_ref();
        LeasedJob {
            job: self.message.clone().with_external_ref(external_ref.clone()),
            external_ref,
            lock_until: self.lock_until,
            retries_remaining: self.retries_remaining,
            retry_available: self.retry_available,
        }
    }
}

/// A job handed out by `lease_next`, with the lease it was granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedJob {
    /// The queued job; `external_ref` is set.
    pub job: Job,
    pub external_ref: ExternalRef,
    pub lock_until: DateTime<Utc>,
    pub retries_remaining: u32,
    pub retry_available: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(secs)
    }

    fn record(policy: &LeasePolicy) -> LeaseRecord {
        LeaseRecord::new(Job::new("A", "https://e", "/src", "local"), policy, at(1))
    }

    #[test]
    fn new_record_is_pending_and_eligible() {
        let policy = LeasePolicy::default();
        let rec = record(&policy);

        assert_eq!(rec.retries_remaining, 3);
        assert!(rec.retry_available);
        assert_eq!(rec.lock_until, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(rec.status, "pending");
        assert_eq!(rec.state(at(1)), LeaseState::Pending);
        assert!(rec.is_eligible(at(1)));
    }

    #[test]
    fn last_lease_marks_record_unavailable() {
        let policy = LeasePolicy::new(1, Duration::from_secs(60));
        let mut rec = record(&policy);

        rec.lease(at(10), &policy);

        assert_eq!(rec.retries_remaining, 0);
        assert!(!rec.retry_available);
        assert_eq!(rec.lock_until, at(70));
        assert_eq!(rec.state(at(20)), LeaseState::Leased);
        assert_eq!(rec.state(at(71)), LeaseState::Dead);
        assert!(!rec.is_eligible(at(71)));
    }

    #[test]
    fn leased_job_carries_reference() {
        let policy = LeasePolicy::default();
        let mut rec = record(&policy);
        rec.lease(at(2), &policy);

        let leased = rec.to_leased();
        assert_eq!(leased.job.external_ref.as_ref(), Some(&leased.external_ref));
        assert_eq!(leased.retries_remaining, 2);
    }

    #[test]
    fn lock_boundary_is_exclusive() {
        let policy = LeasePolicy::new(3, Duration::from_secs(60));
        let mut rec = record(&policy);
        rec.lease(at(0), &policy);

        assert!(!rec.is_eligible(at(60)));
        assert!(rec.is_eligible(at(61)));
    }

    proptest! {
        #[test]
        fn budget_never_increases_and_dead_is_terminal(
            attempts in 0u32..6,
            steps in proptest::collection::vec(1i64..2_000, 1..12),
        ) {
            let policy = LeasePolicy::new(attempts, Duration::from_secs(100));
            let mut rec = record(&policy);
            let mut now = at(1);
            let mut leases = 0u32;
            let mut was_dead = false;

            for step in steps {
                now += chrono::Duration::seconds(step);
                let before = rec.retries_remaining;

                if rec.is_eligible(now) {
                    prop_assert!(!was_dead);
                    rec.lease(now, &policy);
                    leases += 1;
                }

                prop_assert!(rec.retries_remaining <= before);
                prop_assert_eq!(rec.retry_available, rec.retries_remaining > 0);
                if rec.state(now) == LeaseState::Dead {
                    was_dead = true;
                }
            }

            prop_assert!(leases <= attempts);
        }
    }
}
