//! The audit pipeline's concrete stages and their collaborator contracts.
//!
//! Wiring is always `ingest -> audit -> response`; collaborators (source
//! managers, auditors, payloaders) plug in through the traits re-exported here.

pub mod audit;
pub mod ingest;
pub mod response;

pub use audit::{AUDITS_SKIPPED_KEY, AuditRunner, AuditStage, Auditor};
pub use ingest::{Ingest, IngestStage, PreparedSource, SourceManager, files_path_for};
pub use response::{Payloader, Respond, ResponseStage};
