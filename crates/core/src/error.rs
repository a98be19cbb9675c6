//! Job-level error model.

use thiserror::Error;

/// Result type used when checking jobs.
pub type JobResult<T> = Result<T, JobValidationError>;

/// A job failed its minimum-requirements check.
///
/// Keep this focused on deterministic problems with the payload itself.
/// Backend and pipeline failures belong to their own crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobValidationError {
    #[error("job does not have a title")]
    MissingTitle,

    #[error("{title}: does not provide an endpoint")]
    MissingEndpoint { title: String },

    #[error("{title}: source url is empty")]
    MissingSourceUrl { title: String },

    #[error("{title}: source type is empty (e.g. zip, git, local)")]
    MissingSourceType { title: String },

    /// An identifier or reference could not be parsed.
    #[error("invalid reference: {0}")]
    InvalidReference(String),
}

impl JobValidationError {
    pub fn invalid_reference(msg: impl Into<String>) -> Self {
        Self::InvalidReference(msg.into())
    }
}
