//! Pipeline error model.
//!
//! Two families, kept apart on purpose:
//!
//! - [`PipelineError`] is structural. It comes back synchronously from
//!   `Stage::run` / `Pipeline::run` and means the pipeline cannot work as wired.
//! - [`StageError`] is per-job. It travels on a stage's error report while the
//!   stage keeps serving the next job.

use thiserror::Error;

use auditflow_core::JobValidationError;

/// Failure of one stage's business logic for one job.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Validation(#[from] JobValidationError),

    #[error("source error: {0}")]
    Source(String),

    #[error("{kind} audit failed: {message}")]
    Audit { kind: String, message: String },

    #[error("payload error: {0}")]
    Payload(String),

    #[error("{0}")]
    Other(String),
}

impl TaskError {
    pub fn source_error(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }

    pub fn audit(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Audit {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    pub fn payload(msg: impl Into<String>) -> Self {
        Self::Payload(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// A per-job failure, tagged with where it happened.
#[derive(Debug, Error)]
#[error("{stage}: {title}: {source}")]
pub struct StageError {
    pub stage: String,
    pub title: String,
    #[source]
    pub source: TaskError,
}

impl StageError {
    pub fn new(stage: impl Into<String>, title: impl Into<String>, source: TaskError) -> Self {
        Self {
            stage: stage.into(),
            title: title.into(),
            source,
        }
    }
}

/// Structural pipeline failure.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A stage slot was empty when it was added.
    #[error("could not add missing stage")]
    MissingStage,

    /// Several stages were offered and at least one could not be added.
    #[error("{failed} of {offered} stages could not be added")]
    StagesRejected { failed: usize, offered: usize },

    /// A stage is missing required wiring (input, output, configuration).
    #[error("stage {stage} is not runnable: {reason}")]
    Setup { stage: String, reason: String },

    /// The OS refused to start a stage or merge thread.
    #[error("failed to spawn {what}: {source}")]
    Spawn {
        what: String,
        #[source]
        source: std::io::Error,
    },

    /// First per-job error observed on the merged error stream.
    #[error(transparent)]
    Stage(#[from] StageError),
}

impl PipelineError {
    pub fn setup(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Setup {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    pub fn spawn(what: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            what: what.into(),
            source,
        }
    }

    /// Whether this error means the pipeline never started.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::MissingStage | Self::StagesRejected { .. } | Self::Setup { .. } | Self::Spawn { .. }
        )
    }
}
