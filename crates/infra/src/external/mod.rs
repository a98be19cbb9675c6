//! Collaborators plugged into the audit pipeline stages.

pub mod http_payloader;
pub mod local_source;
pub mod manifest_auditor;

pub use http_payloader::HttpPayloader;
pub use local_source::LocalSource;
pub use manifest_auditor::ManifestAuditor;
