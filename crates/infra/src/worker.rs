//! Queue worker: feeds leased jobs into a pipeline and deletes completed ones.
//!
//! Two named threads per worker:
//!
//! - the **lease loop** calls `lease_next`, blocks on the pipeline input (which is
//!   where backpressure reaches the queue), idles for `poll_interval` when the
//!   queue is empty and backs off on transient or quota failures;
//! - the **completion loop** deletes the record of every job state leaving the
//!   terminal stage.
//!
//! A job that fails in any stage never reaches the completion loop; its lock
//! expires and another lease picks it up while the retry budget lasts.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use auditflow_core::Job;
use auditflow_pipeline::{CancellationToken, JobRunState};

use crate::backoff::{Backoff, RetryPolicy};
use crate::config::{DEFAULT_POLL_INTERVAL, WorkerConfig};
use crate::queue::{ErrorClass, QueueError, QueueProvider};

/// Queue worker settings.
#[derive(Debug, Clone)]
pub struct QueueWorkerConfig {
    /// Thread name prefix and log field
    pub name: String,
    /// Idle delay when the queue has nothing eligible
    pub poll_interval: Duration,
    /// Backoff after `Transient` failures
    pub transient: RetryPolicy,
    /// Backoff after `QuotaExceeded` failures
    pub quota: RetryPolicy,
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            name: "queue-worker".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            transient: RetryPolicy::transient(),
            quota: RetryPolicy::quota(),
        }
    }
}

impl QueueWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_backoff(mut self, transient: RetryPolicy, quota: RetryPolicy) -> Self {
        self.transient = transient;
        self.quota = quota;
        self
    }
}

impl From<&WorkerConfig> for QueueWorkerConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self::default().with_poll_interval(config.poll_interval)
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub leased: u64,
    pub completed: u64,
    pub deletes_failed: u64,
    pub transient_errors: u64,
    pub quota_errors: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to spawn worker thread `{thread}`: {source}")]
    Spawn {
        thread: String,
        #[source]
        source: std::io::Error,
    },
}

type SharedStats = Arc<Mutex<WorkerStats>>;

fn lock_stats(stats: &SharedStats) -> MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Polls a [`QueueProvider`] on behalf of one pipeline.
pub struct QueueWorker {
    provider: Arc<dyn QueueProvider>,
    config: QueueWorkerConfig,
    token: CancellationToken,
}

impl QueueWorker {
    /// `token` should be the pipeline's, so either side can stop the other.
    pub fn new(provider: Arc<dyn QueueProvider>, token: CancellationToken) -> Self {
        Self {
            provider,
            config: QueueWorkerConfig::default(),
            token,
        }
    }

    pub fn with_config(mut self, config: QueueWorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Start both loops.
    ///
    /// `input` is the first stage's input; `completed` is the terminal stage's output.
    pub fn spawn(self, input: Sender<Job>, completed: Receiver<JobRunState>) -> Result<WorkerHandle, WorkerError> {
        let stats: SharedStats = Arc::new(Mutex::new(WorkerStats::default()));
        let started = Instant::now();
        let backend = self.provider.backend();

        let lease_name = format!("{}-lease", self.config.name);
        let lease = {
            let provider = self.provider.clone();
            let config = self.config.clone();
            let token = self.token.clone();
            let stats = stats.clone();
            thread::Builder::new()
                .name(lease_name.clone())
                .spawn(move || lease_loop(&*provider, &config, &token, &input, &stats))
                .map_err(|source| WorkerError::Spawn {
                    thread: lease_name,
                    source,
                })?
        };

        let completion_name = format!("{}-complete", self.config.name);
        let completion = {
            let provider = self.provider.clone();
            let name = self.config.name.clone();
            let token = self.token.clone();
            let stats = stats.clone();
            thread::Builder::new()
                .name(completion_name.clone())
                .spawn(move || completion_loop(&*provider, &name, &token, &completed, &stats))
        };
        let completion = match completion {
            Ok(join) => join,
            Err(source) => {
                self.token.cancel();
                let _ = lease.join();
                return Err(WorkerError::Spawn {
                    thread: completion_name,
                    source,
                });
            }
        };

        info!(worker = %self.config.name, backend, "queue worker started");

        Ok(WorkerHandle {
            name: self.config.name,
            backend,
            token: self.token,
            lease: Some(lease),
            completion: Some(completion),
            stats,
            started,
        })
    }
}

/// Handle to a running [`QueueWorker`].
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    backend: &'static str,
    token: CancellationToken,
    lease: Option<thread::JoinHandle<Result<(), QueueError>>>,
    completion: Option<thread::JoinHandle<()>>,
    stats: SharedStats,
    started: Instant,
}

impl WorkerHandle {
    pub fn stats(&self) -> WorkerStats {
        let mut stats = lock_stats(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// True once both loops have exited.
    pub fn is_finished(&self) -> bool {
        self.lease.as_ref().is_none_or(|j| j.is_finished())
            && self.completion.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Cancel, join both loops and return the fatal error that stopped leasing, if any.
    pub fn shutdown(mut self) -> Result<(), QueueError> {
        self.token.cancel();

        let outcome = match self.lease.take().map(thread::JoinHandle::join) {
            Some(Ok(outcome)) => outcome,
            Some(Err(_)) => Err(QueueError::fatal(self.backend, "lease loop panicked")),
            None => Ok(()),
        };
        if let Some(join) = self.completion.take() {
            if join.join().is_err() {
                error!(worker = %self.name, "completion loop panicked");
            }
        }

        let stats = self.stats();
        info!(
            worker = %self.name,
            leased = stats.leased,
            completed = stats.completed,
            deletes_failed = stats.deletes_failed,
            "queue worker stopped"
        );
        outcome
    }
}

fn lease_loop(
    provider: &dyn QueueProvider,
    config: &QueueWorkerConfig,
    token: &CancellationToken,
    input: &Sender<Job>,
    stats: &SharedStats,
) -> Result<(), QueueError> {
    debug!(worker = %config.name, "lease loop started");
    let mut transient = Backoff::new(config.transient.clone());
    let mut quota = Backoff::new(config.quota.clone());

    let outcome = loop {
        if token.is_cancelled() {
            break Ok(());
        }

        match provider.lease_next() {
            Ok(Some(leased)) => {
                transient.reset();
                quota.reset();
                lock_stats(stats).leased += 1;
                debug!(
                    worker = %config.name,
                    external_ref = %leased.external_ref,
                    title = %leased.job.title,
                    retries_remaining = leased.retries_remaining,
                    "job leased"
                );

                select! {
                    send(input, leased.job) -> sent => if sent.is_err() {
                        warn!(worker = %config.name, "pipeline input closed");
                        break Ok(());
                    },
                    recv(token.cancelled()) -> _ => break Ok(()),
                }
            }
            Ok(None) => {
                if token.wait_timeout(config.poll_interval) {
                    break Ok(());
                }
            }
            Err(err) => {
                let delay = match err.class() {
                    ErrorClass::Transient => {
                        lock_stats(stats).transient_errors += 1;
                        transient.next_delay()
                    }
                    ErrorClass::QuotaExceeded => {
                        lock_stats(stats).quota_errors += 1;
                        quota.next_delay()
                    }
                    ErrorClass::Fatal => {
                        error!(worker = %config.name, error = %err, "fatal queue error, stopping");
                        token.cancel();
                        break Err(err);
                    }
                };
                warn!(
                    worker = %config.name,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "lease failed, backing off"
                );
                if token.wait_timeout(delay) {
                    break Ok(());
                }
            }
        }
    };

    debug!(worker = %config.name, "lease loop stopped");
    outcome
}

fn completion_loop(
    provider: &dyn QueueProvider,
    name: &str,
    token: &CancellationToken,
    completed: &Receiver<JobRunState>,
    stats: &SharedStats,
) {
    debug!(worker = %name, "completion loop started");
    loop {
        select! {
            recv(completed) -> state => match state {
                Ok(state) => complete(provider, name, &state, stats),
                Err(_) => break,
            },
            recv(token.cancelled()) -> _ => {
                // Finished work already in the channel still gets its record removed.
                while let Ok(state) = completed.try_recv() {
                    complete(provider, name, &state, stats);
                }
                break;
            }
        }
    }
    debug!(worker = %name, "completion loop stopped");
}

fn complete(provider: &dyn QueueProvider, name: &str, state: &JobRunState, stats: &SharedStats) {
    let Some(external_ref) = state.job.external_ref.as_ref() else {
        warn!(worker = %name, title = %state.job.title, "completed job carries no queue reference");
        lock_stats(stats).deletes_failed += 1;
        return;
    };

    match provider.delete(external_ref) {
        Ok(()) => {
            lock_stats(stats).completed += 1;
            info!(worker = %name, external_ref = %external_ref, title = %state.job.title, "job completed");
        }
        Err(err) => {
            lock_stats(stats).deletes_failed += 1;
            warn!(worker = %name, external_ref = %external_ref, error = %err, "failed to delete completed job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use auditflow_core::ExternalRef;
    use crossbeam_channel::bounded;

    use crate::queue::{InMemoryQueue, LeasedJob};

    fn job(title: &str) -> Job {
        Job::new(title, "https://reports.example/api", format!("/src/{title}"), "local")
    }

    fn fast_config() -> QueueWorkerConfig {
        QueueWorkerConfig::default()
            .with_name("test-worker")
            .with_poll_interval(Duration::from_millis(5))
            .with_backoff(
                RetryPolicy::fixed(Duration::from_millis(1)),
                RetryPolicy::fixed(Duration::from_millis(2)),
            )
    }

    /// Stand-in pipeline: forwards every job straight to the completion channel,
    /// except titles listed in `drop`.
    fn passthrough(input: Receiver<Job>, output: Sender<JobRunState>, drop: &'static [&'static str]) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            for job in input {
                if drop.contains(&job.title.as_str()) {
                    continue;
                }
                if output.send(JobRunState::new(job)).is_err() {
                    break;
                }
            }
        })
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn completed_jobs_are_deleted() {
        let queue = Arc::new(InMemoryQueue::new());
        for title in ["a", "b", "c"] {
            queue.enqueue(&job(title)).unwrap();
        }

        let (in_tx, in_rx) = bounded(1);
        let (out_tx, out_rx) = bounded(1);
        let stage = passthrough(in_rx, out_tx, &[]);

        let handle = QueueWorker::new(queue.clone(), CancellationToken::new())
            .with_config(fast_config())
            .spawn(in_tx, out_rx)
            .unwrap();

        wait_until(|| queue.is_empty());
        let stats = handle.stats();
        assert_eq!(stats.leased, 3);
        assert_eq!(stats.completed, 3);

        handle.shutdown().unwrap();
        stage.join().unwrap();
    }

    #[test]
    fn dropped_jobs_stay_in_the_queue() {
        let queue = Arc::new(InMemoryQueue::new());
        let kept = queue.enqueue(&job("fails")).unwrap();
        queue.enqueue(&job("passes")).unwrap();

        let (in_tx, in_rx) = bounded(1);
        let (out_tx, out_rx) = bounded(1);
        let stage = passthrough(in_rx, out_tx, &["fails"]);

        let handle = QueueWorker::new(queue.clone(), CancellationToken::new())
            .with_config(fast_config())
            .spawn(in_tx, out_rx)
            .unwrap();

        wait_until(|| handle.stats().completed == 1);
        handle.shutdown().unwrap();
        stage.join().unwrap();

        assert_eq!(queue.len(), 1);
        let record = queue.record(&kept).unwrap();
        assert_eq!(record.retries_remaining, 2);
    }

    /// Fails the first `failures` leases with `class`, then delegates.
    #[derive(Debug)]
    struct Flaky {
        inner: InMemoryQueue,
        failures: AtomicU32,
        class: ErrorClass,
    }

    impl QueueProvider for Flaky {
        fn backend(&self) -> &'static str {
            "flaky"
        }

        fn enqueue(&self, job: &Job) -> Result<ExternalRef, QueueError> {
            self.inner.enqueue(job)
        }

        fn lease_next(&self) -> Result<Option<LeasedJob>, QueueError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(QueueError::classified(self.class, "flaky", "injected"));
            }
            self.inner.lease_next()
        }

        fn delete(&self, external_ref: &ExternalRef) -> Result<(), QueueError> {
            self.inner.delete(external_ref)
        }

        fn close(&self) -> Result<(), QueueError> {
            Ok(())
        }
    }

    fn flaky(failures: u32, class: ErrorClass) -> Arc<Flaky> {
        Arc::new(Flaky {
            inner: InMemoryQueue::new(),
            failures: AtomicU32::new(failures),
            class,
        })
    }

    #[test]
    fn transient_and_quota_failures_back_off_and_recover() {
        for class in [ErrorClass::Transient, ErrorClass::QuotaExceeded] {
            let queue = flaky(2, class);
            queue.enqueue(&job("eventually")).unwrap();

            let (in_tx, in_rx) = bounded(1);
            let (out_tx, out_rx) = bounded(1);
            let stage = passthrough(in_rx, out_tx, &[]);

            let handle = QueueWorker::new(queue.clone(), CancellationToken::new())
                .with_config(fast_config())
                .spawn(in_tx, out_rx)
                .unwrap();

            wait_until(|| handle.stats().completed == 1);
            let stats = handle.stats();
            match class {
                ErrorClass::Transient => assert_eq!(stats.transient_errors, 2),
                _ => assert_eq!(stats.quota_errors, 2),
            }
            handle.shutdown().unwrap();
            stage.join().unwrap();
        }
    }

    #[test]
    fn fatal_failure_stops_the_worker_and_cancels() {
        let queue = flaky(1, ErrorClass::Fatal);
        let token = CancellationToken::new();

        let (in_tx, _in_rx) = bounded::<Job>(1);
        let (_out_tx, out_rx) = bounded::<JobRunState>(1);
        let handle = QueueWorker::new(queue, token.clone())
            .with_config(fast_config())
            .spawn(in_tx, out_rx)
            .unwrap();

        wait_until(|| token.is_cancelled());
        let err = handle.shutdown().unwrap_err();
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[test]
    fn shutdown_unblocks_a_full_pipeline() {
        let queue = Arc::new(InMemoryQueue::new());
        for i in 0..3 {
            queue.enqueue(&job(&format!("j{i}"))).unwrap();
        }

        // Nobody reads the input: the lease loop blocks on the second send.
        let (in_tx, _in_rx) = bounded::<Job>(1);
        let (_out_tx, out_rx) = bounded::<JobRunState>(1);
        let handle = QueueWorker::new(queue.clone(), CancellationToken::new())
            .with_config(fast_config())
            .spawn(in_tx, out_rx)
            .unwrap();

        wait_until(|| handle.stats().leased == 2);
        handle.shutdown().unwrap();
        assert_eq!(queue.len(), 3);
    }
}
