//! The audit job payload producers put on the queue.

use serde::{Deserialize, Serialize};

use crate::error::{JobResult, JobValidationError};
use crate::id::ExternalRef;

/// Payload type used when a job does not name one.
pub const DEFAULT_PAYLOAD_TYPE: &str = "tide";

/// A unit of audit work.
///
/// Producers create it once; nothing downstream mutates it. The queue fills in
/// `external_ref` on the copy it hands to a worker so the record can be deleted later.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub title: String,
    pub response_api_endpoint: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub payload_type: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_type: Option<String>,
    pub source_url: String,
    pub source_type: String,
    #[serde(default)]
    pub request_client: String,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub visibility: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<ExternalRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audits: Vec<Audit>,
}

/// One requested audit kind with its options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audit {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<AuditOptions>,
}

impl Audit {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            options: None,
        }
    }

    pub fn with_options(mut self, options: AuditOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Per-audit options. All fields are optional and passed through to the auditor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standard: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(rename = "runtime-set", default, skip_serializing_if = "Option::is_none")]
    pub runtime_set: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore: Option<String>,
    #[serde(rename = "standard-override", default, skip_serializing_if = "Option::is_none")]
    pub standard_override: Option<String>,
}

impl Job {
    /// Create a job with the fields every worker needs.
    pub fn new(
        title: impl Into<String>,
        response_api_endpoint: impl Into<String>,
        source_url: impl Into<String>,
        source_type: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            response_api_endpoint: response_api_endpoint.into(),
            source_url: source_url.into(),
            source_type: source_type.into(),
            ..Default::default()
        }
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = slug.into();
        self
    }

    pub fn with_audit(mut self, audit: Audit) -> Self {
        self.audits.push(audit);
        self
    }

    pub fn with_payload_type(mut self, payload_type: impl Into<String>) -> Self {
        self.payload_type = payload_type.into();
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// Payload type to respond with, falling back to [`DEFAULT_PAYLOAD_TYPE`].
    pub fn payload_type_or_default(&self) -> &str {
        if self.payload_type.is_empty() {
            DEFAULT_PAYLOAD_TYPE
        } else {
            &self.payload_type
        }
    }

    /// Copy of this job carrying the given queue reference.
    pub fn with_external_ref(mut self, external_ref: ExternalRef) -> Self {
        self.external_ref = Some(external_ref);
        self
    }

    /// Copy of this job with queue metadata stripped, for comparing payloads.
    pub fn without_external_ref(mut self) -> Self {
        self.external_ref = None;
        self
    }

    /// Ensure the job has the minimum requirements to be processed.
    pub fn validate(&self) -> JobResult<()> {
        if self.title.is_empty() {
            return Err(JobValidationError::MissingTitle);
        }

        let title = || self.title.clone();

        if self.response_api_endpoint.is_empty() {
            return Err(JobValidationError::MissingEndpoint { title: title() });
        }
        if self.source_url.is_empty() {
            return Err(JobValidationError::MissingSourceUrl { title: title() });
        }
        if self.source_type.is_empty() {
            return Err(JobValidationError::MissingSourceType { title: title() });
        }

        Ok(())
    }
}
