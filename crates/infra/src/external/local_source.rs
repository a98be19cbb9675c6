//! Source manager for directories on the local file system.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use auditflow_core::Job;
use auditflow_pipeline::TaskError;
use auditflow_pipeline::stages::{PreparedSource, SourceManager};

pub const SOURCE_TYPE: &str = "local";

/// Copies a local directory (`source_url` is a path or a `file://` URL) into the files path.
#[derive(Debug, Clone, Default)]
pub struct LocalSource;

impl LocalSource {
    pub fn new() -> Self {
        Self
    }
}

impl SourceManager for LocalSource {
    fn handles(&self, source_type: &str) -> bool {
        source_type == SOURCE_TYPE
    }

    fn prepare_files(&mut self, job: &Job, dest: &Path) -> Result<PreparedSource, TaskError> {
        let src = PathBuf::from(job.source_url.strip_prefix("file://").unwrap_or(&job.source_url));
        if !src.is_dir() {
            return Err(TaskError::source_error(format!(
                "source `{}` is not a directory",
                src.display()
            )));
        }

        let src = src.canonicalize().map_err(|e| io_error("resolve", &src, e))?;

        // A redelivered job starts from a clean copy.
        if dest.exists() {
            let existing = dest.canonicalize().map_err(|e| io_error("resolve", dest, e))?;
            if src.starts_with(&existing) {
                return Err(TaskError::source_error(format!(
                    "source `{}` lies inside files path `{}`",
                    src.display(),
                    dest.display()
                )));
            }
            fs::remove_dir_all(dest).map_err(|e| io_error("clear files path", dest, e))?;
        }
        fs::create_dir_all(dest).map_err(|e| io_error("create files path", dest, e))?;

        // The files path may sit under the source; never copy it into itself.
        let skip = dest.canonicalize().map_err(|e| io_error("resolve", dest, e))?;
        let mut files = Vec::new();
        copy_tree(&src, dest, &skip, Path::new(""), &mut files)?;
        files.sort();

        let mut hasher = Sha256::new();
        for rel in &files {
            let bytes = fs::read(dest.join(rel)).map_err(|e| io_error("read", &dest.join(rel), e))?;
            hasher.update(rel.as_bytes());
            hasher.update([0u8]);
            hasher.update(&bytes);
        }
        let checksum = format!("{:x}", hasher.finalize());

        debug!(source = %src.display(), files = files.len(), %checksum, "local source copied");
        Ok(PreparedSource { checksum, files })
    }
}

fn copy_tree(src: &Path, dest: &Path, skip: &Path, rel: &Path, files: &mut Vec<String>) -> Result<(), TaskError> {
    let dir = src.join(rel);
    let entries = fs::read_dir(&dir).map_err(|e| io_error("list", &dir, e))?;

    for entry in entries {
        let entry = entry.map_err(|e| io_error("list", &dir, e))?;
        let file_type = entry.file_type().map_err(|e| io_error("stat", &entry.path(), e))?;
        let child = rel.join(entry.file_name());

        if file_type.is_dir() {
            if entry.path() == skip {
                continue;
            }
            let target = dest.join(&child);
            fs::create_dir_all(&target).map_err(|e| io_error("create", &target, e))?;
            copy_tree(src, dest, skip, &child, files)?;
        } else if file_type.is_file() {
            let target = dest.join(&child);
            fs::copy(entry.path(), &target).map_err(|e| io_error("copy", &target, e))?;
            files.push(relative_name(&child));
        }
        // Symlinks are skipped.
    }
    Ok(())
}

fn relative_name(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn io_error(action: &str, path: &Path, err: io::Error) -> TaskError {
    TaskError::source_error(format!("failed to {action} `{}`: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("inc")).unwrap();
        fs::write(dir.path().join("plugin.php"), "<?php // main").unwrap();
        fs::write(dir.path().join("inc/helpers.php"), "<?php // helpers").unwrap();
        dir
    }

    fn job_for(src: &Path) -> Job {
        Job::new("Plugin", "https://e", src.display().to_string(), SOURCE_TYPE)
    }

    #[test]
    fn copies_the_tree_and_lists_files() {
        let src = fixture();
        let dest = tempfile::tempdir().unwrap();
        let target = dest.path().join("audit-x");

        let prepared = LocalSource::new().prepare_files(&job_for(src.path()), &target).unwrap();

        assert_eq!(prepared.files, vec!["inc/helpers.php".to_string(), "plugin.php".to_string()]);
        assert_eq!(prepared.checksum.len(), 64);
        assert_eq!(fs::read_to_string(target.join("inc/helpers.php")).unwrap(), "<?php // helpers");
    }

    #[test]
    fn checksum_is_stable_and_content_sensitive() {
        let src = fixture();
        let dest = tempfile::tempdir().unwrap();
        let mut source = LocalSource::new();
        let job = job_for(src.path());

        let first = source.prepare_files(&job, &dest.path().join("a")).unwrap();
        let again = source.prepare_files(&job, &dest.path().join("a")).unwrap();
        assert_eq!(first, again);

        fs::write(src.path().join("plugin.php"), "<?php // changed").unwrap();
        let changed = source.prepare_files(&job, &dest.path().join("a")).unwrap();
        assert_ne!(first.checksum, changed.checksum);
    }

    #[test]
    fn missing_directory_is_a_source_error() {
        let dest = tempfile::tempdir().unwrap();
        let job = job_for(Path::new("/definitely/not/here"));

        let err = LocalSource::new().prepare_files(&job, dest.path()).unwrap_err();
        assert!(matches!(err, TaskError::Source(_)));
    }

    #[test]
    fn files_path_inside_the_source_is_not_copied() {
        let src = fixture();
        let target = src.path().join("work").join("audit-x");

        let prepared = LocalSource::new().prepare_files(&job_for(src.path()), &target).unwrap();

        assert_eq!(prepared.files, vec!["inc/helpers.php".to_string(), "plugin.php".to_string()]);
        assert!(!target.join("work/audit-x").exists());

        let again = LocalSource::new().prepare_files(&job_for(src.path()), &target).unwrap();
        assert_eq!(again, prepared);
    }

    #[test]
    fn source_inside_the_files_path_is_rejected() {
        let dest = tempfile::tempdir().unwrap();
        let src = dest.path().join("checkout");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("plugin.php"), "<?php").unwrap();

        let err = LocalSource::new().prepare_files(&job_for(&src), dest.path()).unwrap_err();
        assert!(matches!(err, TaskError::Source(_)));
        assert!(src.join("plugin.php").exists());
    }

    #[test]
    fn accepts_file_urls() {
        let src = fixture();
        let dest = tempfile::tempdir().unwrap();
        let job = Job::new("Plugin", "https://e", format!("file://{}", src.path().display()), SOURCE_TYPE);

        let prepared = LocalSource::new().prepare_files(&job, &dest.path().join("x")).unwrap();
        assert_eq!(prepared.files.len(), 2);
    }
}
