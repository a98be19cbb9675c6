//! Audit: run every requested audit kind that has a registered auditor.

use std::path::Path;

use serde_json::{Value as JsonValue, json};
use tracing::{debug, info};

use auditflow_core::{Audit, Job};

use crate::error::TaskError;
use crate::process::Process;
use crate::stage::{ProcessStage, Task};
use crate::state::{JobRunState, StageState};

/// Result key listing the audit kinds no auditor was registered for.
pub const AUDITS_SKIPPED_KEY: &str = "audits_skipped";

/// One kind of audit (coding standards, performance, ...).
///
/// The output is stored in the job's results under [`Auditor::kind`].
pub trait Auditor: Send {
    fn kind(&self) -> &str;

    fn audit(&mut self, job: &Job, audit: &Audit, files_path: &Path) -> Result<JsonValue, TaskError>;
}

/// Middle stage: dispatches each requested audit to its auditor.
#[derive(Default)]
pub struct AuditRunner {
    auditors: Vec<Box<dyn Auditor>>,
}

pub type AuditStage = ProcessStage<JobRunState, AuditRunner>;

impl AuditRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auditor<A>(mut self, auditor: A) -> Self
    where
        A: Auditor + 'static,
    {
        self.auditors.push(Box::new(auditor));
        self
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.auditors.iter().map(|a| a.kind())
    }
}

impl Task for AuditRunner {
    fn name(&self) -> &str {
        "audit"
    }

    fn execute(&mut self, process: &mut Process) -> Result<(), TaskError> {
        let files_path = process
            .files_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| TaskError::other("could not determine files path"))?;
        let job = process.message().clone();

        let mut skipped = Vec::new();
        for requested in &job.audits {
            let Some(auditor) = self
                .auditors
                .iter_mut()
                .find(|a| a.kind() == requested.kind)
            else {
                debug!(job = %job.title, kind = %requested.kind, "no auditor registered");
                skipped.push(requested.kind.clone());
                continue;
            };

            info!(job = %job.title, kind = %requested.kind, "running audit");
            let output = auditor.audit(&job, requested, &files_path)?;
            process.result_mut().insert(requested.kind.clone(), output);
        }

        if !skipped.is_empty() {
            process.result_mut().insert(AUDITS_SKIPPED_KEY, json!(skipped));
        }
        Ok(())
    }
}
