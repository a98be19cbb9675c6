//! Ingest: validate the job and fetch its source into a per-job files path.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use auditflow_core::Job;

use crate::error::{PipelineError, TaskError};
use crate::process::Process;
use crate::stage::{ProcessStage, Task};
use crate::state::{ResultMap, StageState};

/// What a source manager produced for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedSource {
    pub checksum: String,
    /// Paths relative to the files path.
    pub files: Vec<String>,
}

/// Fetches a job's source code into a local directory.
pub trait SourceManager: Send {
    /// Whether this manager understands the job's `source_type`.
    fn handles(&self, source_type: &str) -> bool;

    /// Materialise the source under `dest` and report its checksum and file list.
    ///
    /// Jobs are delivered at least once; preparing into an existing `dest` must work.
    fn prepare_files(&mut self, job: &Job, dest: &Path) -> Result<PreparedSource, TaskError>;
}

/// Per-job working directory: `<temp>/audit-<base64url(sha256(source_url))>`.
pub fn files_path_for(temp_folder: &Path, source_url: &str) -> PathBuf {
    let digest = Sha256::digest(source_url.as_bytes());
    temp_folder.join(format!("audit-{}", URL_SAFE.encode(digest)))
}

/// First stage of an audit pipeline.
pub struct Ingest {
    temp_folder: PathBuf,
    sources: Vec<Box<dyn SourceManager>>,
}

pub type IngestStage = ProcessStage<Job, Ingest>;

impl Ingest {
    pub fn new(temp_folder: impl Into<PathBuf>) -> Self {
        Self {
            temp_folder: temp_folder.into(),
            sources: Vec::new(),
        }
    }

    pub fn with_source<S>(mut self, source: S) -> Self
    where
        S: SourceManager + 'static,
    {
        self.sources.push(Box::new(source));
        self
    }

    pub fn temp_folder(&self) -> &Path {
        &self.temp_folder
    }
}

impl Task for Ingest {
    fn name(&self) -> &str {
        "ingest"
    }

    fn validate_setup(&self) -> Result<(), PipelineError> {
        if self.temp_folder.as_os_str().is_empty() {
            return Err(PipelineError::setup(self.name(), "no temp folder provided"));
        }
        Ok(())
    }

    fn execute(&mut self, process: &mut Process) -> Result<(), TaskError> {
        let job = process.message().clone();
        job.validate()?;

        process.set_results(ResultMap::new());
        info!(job = %job.title, source_type = %job.source_type, "ingesting");

        let source = self
            .sources
            .iter_mut()
            .find(|s| s.handles(&job.source_type))
            .ok_or_else(|| {
                TaskError::source_error(format!(
                    "no source manager for source type '{}'",
                    job.source_type
                ))
            })?;

        let files_path = files_path_for(&self.temp_folder, &job.source_url);
        process.set_files_path(Some(files_path.clone()));

        let prepared = source.prepare_files(&job, &files_path)?;
        if prepared.checksum.is_empty() {
            return Err(TaskError::source_error("could not calculate project checksum"));
        }

        debug!(job = %job.title, checksum = %prepared.checksum, files = prepared.files.len(), "source prepared");
        process.result_mut().insert("checksum", prepared.checksum);
        process.result_mut().insert("files", json!(prepared.files));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSource {
        kind: &'static str,
        checksum: &'static str,
        seen: Vec<PathBuf>,
    }

    impl SourceManager for FakeSource {
        fn handles(&self, source_type: &str) -> bool {
            source_type == self.kind
        }

        fn prepare_files(&mut self, _job: &Job, dest: &Path) -> Result<PreparedSource, TaskError> {
            self.seen.push(dest.to_path_buf());
            Ok(PreparedSource {
                checksum: self.checksum.to_string(),
                files: vec!["plugin.php".into()],
            })
        }
    }

    fn ingest(checksum: &'static str) -> Ingest {
        Ingest::new("/tmp/auditflow").with_source(FakeSource {
            kind: "zip",
            checksum,
            seen: Vec::new(),
        })
    }

    fn process_for(job: Job) -> Process {
        let mut process = Process::new();
        process.set_message(job);
        process
    }

    #[test]
    fn files_path_is_derived_from_source_url() {
        let a = files_path_for(Path::new("/tmp"), "https://example.com/a.zip");
        let b = files_path_for(Path::new("/tmp"), "https://example.com/b.zip");

        assert_ne!(a, b);
        assert_eq!(a, files_path_for(Path::new("/tmp"), "https://example.com/a.zip"));
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("audit-"));
        assert!(!name.contains('/') && !name.contains('+'));
    }

    #[test]
    fn writes_checksum_and_files() {
        let mut task = ingest("abc123");
        let mut process = process_for(Job::new("A", "https://e", "https://x/a.zip", "zip"));
        process.result_mut().insert("stale", true);

        task.execute(&mut process).unwrap();

        assert_eq!(process.result().get("checksum"), Some(&json!("abc123")));
        assert_eq!(process.result().get("files"), Some(&json!(["plugin.php"])));
        assert!(!process.result().contains_key("stale"));
        assert_eq!(
            process.files_path(),
            Some(files_path_for(Path::new("/tmp/auditflow"), "https://x/a.zip").as_path())
        );
    }

    #[test]
    fn invalid_job_is_a_task_error() {
        let mut task = ingest("abc");
        let mut process = process_for(Job::new("A", "", "https://x/a.zip", "zip"));

        let err = task.execute(&mut process).unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
    }

    #[test]
    fn unknown_source_type_is_a_task_error() {
        let mut task = ingest("abc");
        let mut process = process_for(Job::new("A", "https://e", "git@x", "git"));

        let err = task.execute(&mut process).unwrap_err();
        assert!(err.to_string().contains("no source manager"));
    }

    #[test]
    fn empty_checksum_is_rejected() {
        let mut task = ingest("");
        let mut process = process_for(Job::new("A", "https://e", "https://x/a.zip", "zip"));

        let err = task.execute(&mut process).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn empty_temp_folder_is_a_setup_error() {
        let err = Ingest::new("").validate_setup().unwrap_err();
        assert!(err.is_setup());
    }
}
