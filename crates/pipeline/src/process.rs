//! The state-holding half of every stage.

use std::path::{Path, PathBuf};

use auditflow_core::Job;

use crate::state::{JobRunState, ResultMap, StageState};

/// Current job, results and files path of one stage.
///
/// A stage owns exactly one `Process`. Upstream state is copied in with
/// [`Process::copy_fields`] and a snapshot is sent downstream, so two stages
/// working on different jobs never see each other's writes.
#[derive(Debug, Clone, Default)]
pub struct Process {
    message: Job,
    result: ResultMap,
    files_path: Option<PathBuf>,
}

impl Process {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_message(&mut self, message: Job) {
        self.message = message;
    }

    pub fn set_results(&mut self, result: ResultMap) {
        self.result = result;
    }

    pub fn result_mut(&mut self) -> &mut ResultMap {
        &mut self.result
    }

    pub fn set_files_path(&mut self, path: Option<PathBuf>) {
        self.files_path = path;
    }

    /// Copy job, results and files path from an upstream unit.
    pub fn copy_fields(&mut self, from: &dyn StageState) {
        self.set_message(from.message().clone());
        self.set_results(from.result().clone());
        self.set_files_path(from.files_path().map(Path::to_path_buf));
    }

    /// Owned copy of the current state, ready to hand downstream.
    pub fn snapshot(&self) -> JobRunState {
        JobRunState {
            job: self.message.clone(),
            result: self.result.clone(),
            files_path: self.files_path.clone(),
        }
    }
}

impl StageState for Process {
    fn message(&self) -> &Job {
        &self.message
    }

    fn result(&self) -> &ResultMap {
        &self.result
    }

    fn files_path(&self) -> Option<&Path> {
        self.files_path.as_deref()
    }
}

/// Something a stage can receive from upstream.
pub trait Inbound: Send + 'static {
    /// Replace the process's current state with this item.
    fn load_into(self, process: &mut Process);
}

impl Inbound for Job {
    fn load_into(self, process: &mut Process) {
        process.set_message(self);
        process.set_results(ResultMap::new());
        process.set_files_path(None);
    }
}

impl Inbound for JobRunState {
    fn load_into(self, process: &mut Process) {
        process.copy_fields(&self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_fields_is_a_value_copy() {
        let mut upstream = JobRunState::new(Job::new("A", "https://e", "/src", "local"));
        upstream.result.insert("checksum", "abc");
        upstream.files_path = Some(PathBuf::from("/tmp/audit-a"));

        let mut process = Process::new();
        process.copy_fields(&upstream);
        process.result_mut().insert("phpcs", "ok");

        assert_eq!(process.message().title, "A");
        assert_eq!(process.files_path(), Some(Path::new("/tmp/audit-a")));
        assert!(process.result().contains_key("phpcs"));
        // Upstream is untouched by downstream writes.
        assert!(!upstream.result.contains_key("phpcs"));
    }

    #[test]
    fn loading_a_raw_job_resets_previous_state() {
        let mut process = Process::new();
        process.result_mut().insert("stale", true);
        process.set_files_path(Some(PathBuf::from("/old")));

        Job::new("B", "https://e", "/src", "local").load_into(&mut process);

        assert_eq!(process.message().title, "B");
        assert!(process.result().is_empty());
        assert!(process.files_path().is_none());
    }
}
