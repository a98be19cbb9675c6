//! Per-job state carried through the pipeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value as JsonValue;

use auditflow_core::Job;

/// Accumulating key/value results for one job.
///
/// Append-only: stages may add or overwrite keys, but there is no way to remove
/// a key another stage wrote.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResultMap(BTreeMap<String, JsonValue>);

impl ResultMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or overwrite a key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.0.iter()
    }

    /// Owned JSON object of every key.
    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.0.clone().into_iter().collect())
    }
}

/// The three things a stage hands to the next one.
///
/// Moves between stages by value; no two stages ever hold the same instance.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRunState {
    pub job: Job,
    pub result: ResultMap,
    pub files_path: Option<PathBuf>,
}

impl JobRunState {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            result: ResultMap::new(),
            files_path: None,
        }
    }
}

/// Read access shared by anything that holds job state.
pub trait StageState {
    fn message(&self) -> &Job;
    fn result(&self) -> &ResultMap;
    fn files_path(&self) -> Option<&Path>;
}

impl StageState for JobRunState {
    fn message(&self) -> &Job {
        &self.job
    }

    fn result(&self) -> &ResultMap {
        &self.result
    }

    fn files_path(&self) -> Option<&Path> {
        self.files_path.as_deref()
    }
}
