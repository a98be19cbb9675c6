//! Behavioural checks every [`QueueProvider`] must pass.
//!
//! Each check builds a fresh queue through the supplied factory, so backends
//! with shared storage must hand out an isolated table/prefix per call. Time is
//! driven by a [`ManualClock`]; nothing here sleeps.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use auditflow_core::{Audit, AuditOptions, Clock, Job, ManualClock};

use super::provider::QueueProvider;
use super::record::LeasePolicy;

const CONTENDERS: usize = 8;

fn job(title: &str) -> Job {
    Job::new(title, "https://reports.example/api", format!("https://src.example/{title}.zip"), "zip")
}

/// Queue built on a fresh manual clock starting just after the epoch.
fn clocked<F, Q>(make: &F, policy: LeasePolicy) -> (Arc<ManualClock>, Q)
where
    F: Fn(Arc<dyn Clock>, LeasePolicy) -> Q,
{
    let clock = Arc::new(ManualClock::starting_at_epoch());
    let shared: Arc<dyn Clock> = clock.clone();
    (clock, make(shared, policy))
}

fn secs(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_default()
}

/// Run every check against queues built by `make`.
pub fn run_all<F, Q>(make: F)
where
    F: Fn(Arc<dyn Clock>, LeasePolicy) -> Q,
    Q: QueueProvider,
{
    round_trip(&make);
    lease_scenario(&make);
    last_retry_clears_availability(&make);
    dead_record_is_never_returned(&make);
    oldest_unlocked_first(&make);
    live_lock_hides_record(&make);
    delete_is_idempotent(&make);
    single_owner_under_contention(&make);
    no_duplicates_while_draining(&make);
}

/// Enqueue then lease returns the same job, plus its reference.
pub fn round_trip<F, Q>(make: &F)
where
    F: Fn(Arc<dyn Clock>, LeasePolicy) -> Q,
    Q: QueueProvider,
{
    let (_, q) = clocked(make, LeasePolicy::default());

    let original = job("round-trip")
        .with_slug("round-trip")
        .with_payload_type("tide")
        .with_audit(Audit::new("phpcs").with_options(AuditOptions {
            standard: Some("WordPress".into()),
            runtime_set: Some("testVersion 7.0-".into()),
            ..Default::default()
        }))
        .forced();
    let external_ref = q.enqueue(&original).expect("enqueue");

    let leased = q.lease_next().expect("lease").expect("a job");
    assert_eq!(leased.external_ref, external_ref);
    assert_eq!(leased.job.external_ref.as_ref(), Some(&external_ref));
    assert_eq!(leased.job.without_external_ref(), original);
}

/// Lease at t0, at t0 + LD + 1s and at t0 + 2(LD + 1s); then the record is dead.
pub fn lease_scenario<F, Q>(make: &F)
where
    F: Fn(Arc<dyn Clock>, LeasePolicy) -> Q,
    Q: QueueProvider,
{
    let policy = LeasePolicy::default();
    let (clock, q) = clocked(make, policy);
    let lock = secs(policy.lock_duration);
    let t0 = clock.now();

    q.enqueue(&job("A")).expect("enqueue");

    let first = q.lease_next().expect("lease").expect("first lease");
    assert_eq!(first.retries_remaining, 2);
    assert!(first.retry_available);
    assert_eq!(first.lock_until, t0 + lock);

    clock.set(t0 + lock + chrono::Duration::seconds(1));
    let second = q.lease_next().expect("lease").expect("second lease");
    assert_eq!(second.retries_remaining, 1);
    assert!(second.retry_available);

    clock.set(t0 + (lock + chrono::Duration::seconds(1)) * 2);
    let third = q.lease_next().expect("lease").expect("third lease");
    assert_eq!(third.retries_remaining, 0);
    assert!(!third.retry_available);

    clock.set(third.lock_until + chrono::Duration::seconds(1));
    assert!(q.lease_next().expect("lease").is_none());
}

/// Leasing with one unit left clears `retry_available` and still locks.
pub fn last_retry_clears_availability<F, Q>(make: &F)
where
    F: Fn(Arc<dyn Clock>, LeasePolicy) -> Q,
    Q: QueueProvider,
{
    let (clock, q) = clocked(make, LeasePolicy::new(1, Duration::from_secs(30)));

    q.enqueue(&job("single-shot")).expect("enqueue");
    let now = clock.now();
    let leased = q.lease_next().expect("lease").expect("a job");

    assert_eq!(leased.retries_remaining, 0);
    assert!(!leased.retry_available);
    assert_eq!(leased.lock_until, now + chrono::Duration::seconds(30));
}

/// After `retry_attempts` leases the record never comes back, however long we wait.
pub fn dead_record_is_never_returned<F, Q>(make: &F)
where
    F: Fn(Arc<dyn Clock>, LeasePolicy) -> Q,
    Q: QueueProvider,
{
    let (clock, q) = clocked(make, LeasePolicy::new(2, Duration::from_secs(10)));

    q.enqueue(&job("doomed")).expect("enqueue");
    for _ in 0..2 {
        assert!(q.lease_next().expect("lease").is_some());
        clock.advance(Duration::from_secs(11));
    }

    for _ in 0..3 {
        assert!(q.lease_next().expect("lease").is_none());
        clock.advance(Duration::from_secs(3600));
    }
}

/// Equal `lock_until`: the older record wins.
pub fn oldest_unlocked_first<F, Q>(make: &F)
where
    F: Fn(Arc<dyn Clock>, LeasePolicy) -> Q,
    Q: QueueProvider,
{
    let (clock, q) = clocked(make, LeasePolicy::default());

    let older = q.enqueue(&job("older")).expect("enqueue");
    clock.advance(Duration::from_secs(1));
    let newer = q.enqueue(&job("newer")).expect("enqueue");
    clock.advance(Duration::from_secs(1));

    assert_eq!(q.lease_next().expect("lease").expect("a job").external_ref, older);
    assert_eq!(q.lease_next().expect("lease").expect("a job").external_ref, newer);
    assert!(q.lease_next().expect("lease").is_none());
}

/// A live lock hides the record until it expires.
pub fn live_lock_hides_record<F, Q>(make: &F)
where
    F: Fn(Arc<dyn Clock>, LeasePolicy) -> Q,
    Q: QueueProvider,
{
    let (clock, q) = clocked(make, LeasePolicy::new(3, Duration::from_secs(60)));

    let r = q.enqueue(&job("locked")).expect("enqueue");
    assert!(q.lease_next().expect("lease").is_some());

    clock.advance(Duration::from_secs(60));
    assert!(q.lease_next().expect("lease").is_none(), "lock boundary is exclusive");

    clock.advance(Duration::from_secs(1));
    assert_eq!(q.lease_next().expect("lease").expect("re-lease").external_ref, r);
}

/// Deleted records are gone; deleting twice or deleting an unknown record succeeds.
pub fn delete_is_idempotent<F, Q>(make: &F)
where
    F: Fn(Arc<dyn Clock>, LeasePolicy) -> Q,
    Q: QueueProvider,
{
    let (clock, q) = clocked(make, LeasePolicy::new(3, Duration::from_secs(5)));

    let r = q.enqueue(&job("delete-me")).expect("enqueue");
    let leased = q.lease_next().expect("lease").expect("a job");
    q.delete(&leased.external_ref).expect("delete");
    q.delete(&r).expect("second delete");
    q.delete(&auditflow_core::RecordId::new().into()).expect("unknown delete");

    clock.advance(Duration::from_secs(60));
    assert!(q.lease_next().expect("lease").is_none());
}

/// N concurrent callers, one eligible record: exactly one wins.
pub fn single_owner_under_contention<F, Q>(make: &F)
where
    F: Fn(Arc<dyn Clock>, LeasePolicy) -> Q,
    Q: QueueProvider,
{
    let (_, q) = clocked(make, LeasePolicy::default());
    q.enqueue(&job("contended")).expect("enqueue");

    let winners = AtomicUsize::new(0);
    let barrier = Barrier::new(CONTENDERS);
    thread::scope(|s| {
        for _ in 0..CONTENDERS {
            s.spawn(|| {
                barrier.wait();
                if q.lease_next().expect("lease").is_some() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });

    assert_eq!(winners.load(Ordering::SeqCst), 1);
}

/// Several workers draining many records never see the same record twice.
pub fn no_duplicates_while_draining<F, Q>(make: &F)
where
    F: Fn(Arc<dyn Clock>, LeasePolicy) -> Q,
    Q: QueueProvider,
{
    const JOBS: usize = 24;
    let (_, q) = clocked(make, LeasePolicy::default());
    for i in 0..JOBS {
        q.enqueue(&job(&format!("job-{i}"))).expect("enqueue");
    }

    let seen = Mutex::new(Vec::new());
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                while let Some(leased) = q.lease_next().expect("lease") {
                    seen.lock().expect("seen").push(leased.external_ref);
                }
            });
        }
    });

    let seen = seen.into_inner().expect("seen");
    let unique: HashSet<_> = seen.iter().cloned().collect();
    assert_eq!(seen.len(), JOBS);
    assert_eq!(unique.len(), JOBS);
}
