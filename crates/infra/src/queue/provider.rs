//! Queue provider contract and its error model.

use std::sync::Arc;

use auditflow_core::{ExternalRef, Job};

use super::record::LeasedJob;

/// How a caller should react to a queue failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Temporary unavailability or throttling: back off and poll again.
    Transient,
    /// A transient failure caused by a backend limit; back off longer.
    QuotaExceeded,
    /// Misconfiguration or corrupt data: stop polling.
    Fatal,
}

/// Queue provider error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("{backend}: transient failure: {message}")]
    Transient { backend: &'static str, message: String },

    #[error("{backend}: quota exceeded: {message}")]
    QuotaExceeded { backend: &'static str, message: String },

    #[error("{backend}: {message}")]
    Fatal { backend: &'static str, message: String },
}

impl QueueError {
    pub fn transient(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Transient {
            backend,
            message: message.into(),
        }
    }

    pub fn quota_exceeded(backend: &'static str, message: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            backend,
            message: message.into(),
        }
    }

    pub fn fatal(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Fatal {
            backend,
            message: message.into(),
        }
    }

    /// Build an error of the given class.
    pub fn classified(class: ErrorClass, backend: &'static str, message: impl Into<String>) -> Self {
        match class {
            ErrorClass::Transient => Self::transient(backend, message),
            ErrorClass::QuotaExceeded => Self::quota_exceeded(backend, message),
            ErrorClass::Fatal => Self::fatal(backend, message),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient { .. } => ErrorClass::Transient,
            Self::QuotaExceeded { .. } => ErrorClass::QuotaExceeded,
            Self::Fatal { .. } => ErrorClass::Fatal,
        }
    }

    /// True for both plain transient failures and quota limits.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Fatal { .. })
    }

    pub fn backend(&self) -> &'static str {
        match self {
            Self::Transient { backend, .. }
            | Self::QuotaExceeded { backend, .. }
            | Self::Fatal { backend, .. } => backend,
        }
    }
}

/// A durable, lease-based, at-least-once job queue.
///
/// Every implementation must guarantee:
///
/// - **Single owner**: concurrent `lease_next` calls never hand the same record
///   to two callers while its lock is live.
/// - **Oldest unlocked first**: among eligible records (`retry_available` and
///   `lock_until < now`), the lowest `(lock_until, created)` wins.
/// - **Bounded retries**: each lease spends one unit of the record's budget;
///   at zero the record is never leased again.
///
/// A job is only removed by `delete`. A worker that crashes, or a pipeline that
/// drops a job, simply lets the lock expire and the job is leased again.
pub trait QueueProvider: Send + Sync {
    /// Short backend name used in logs.
    fn backend(&self) -> &'static str;

    /// Persist a new pending record for `job` and return its reference.
    fn enqueue(&self, job: &Job) -> Result<ExternalRef, QueueError>;

    /// Lease the next eligible record, or `Ok(None)` if there is none.
    fn lease_next(&self) -> Result<Option<LeasedJob>, QueueError>;

    /// Remove a record. Deleting an unknown or already deleted record succeeds.
    fn delete(&self, external_ref: &ExternalRef) -> Result<(), QueueError>;

    /// Release backend resources.
    fn close(&self) -> Result<(), QueueError>;
}

impl<T> QueueProvider for Arc<T>
where
    T: QueueProvider + ?Sized,
{
    fn backend(&self) -> &'static str {
        (**self).backend()
    }

    fn enqueue(&self, job: &Job) -> Result<ExternalRef, QueueError> {
        (**self).enqueue(job)
    }

    fn lease_next(&self) -> Result<Option<LeasedJob>, QueueError> {
        (**self).lease_next()
    }

    fn delete(&self, external_ref: &ExternalRef) -> Result<(), QueueError> {
        (**self).delete(external_ref)
    }

    fn close(&self) -> Result<(), QueueError> {
        (**self).close()
    }
}

impl<T> QueueProvider for Box<T>
where
    T: QueueProvider + ?Sized,
{
    fn backend(&self) -> &'static str {
        (**self).backend()
    }

    fn enqueue(&self, job: &Job) -> Result<ExternalRef, QueueError> {
        (**self).enqueue(job)
    }

    fn lease_next(&self) -> Result<Option<LeasedJob>, QueueError> {
        (**self).lease_next()
    }

    fn delete(&self, external_ref: &ExternalRef) -> Result<(), QueueError> {
        (**self).delete(external_ref)
    }

    fn close(&self) -> Result<(), QueueError> {
        (**self).close()
    }
}
