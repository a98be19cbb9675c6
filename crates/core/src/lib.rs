//! `auditflow-core` — the job model shared by the queue and the pipeline.
//!
//! This crate holds pure data and time primitives (no infrastructure concerns).

pub mod clock;
pub mod error;
pub mod id;
pub mod job;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{JobResult, JobValidationError};
pub use id::{ExternalRef, RecordId};
pub use job::{Audit, AuditOptions, DEFAULT_PAYLOAD_TYPE, Job};
