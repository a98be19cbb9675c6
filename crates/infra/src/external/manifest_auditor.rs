//! Built-in `manifest` audit: a file inventory of the prepared source.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_json::Value as JsonValue;

use auditflow_core::{Audit, Job};
use auditflow_pipeline::TaskError;
use auditflow_pipeline::stages::Auditor;

pub const KIND: &str = "manifest";

#[derive(Debug, Default, Serialize)]
struct Manifest {
    files: u64,
    bytes: u64,
    /// File count per lowercased extension; `""` for none.
    extensions: BTreeMap<String, u64>,
}

/// Counts files and bytes per extension. `options.ignore` is a comma-separated
/// list of path fragments to leave out.
#[derive(Debug, Clone, Default)]
pub struct ManifestAuditor;

impl ManifestAuditor {
    pub fn new() -> Self {
        Self
    }
}

impl Auditor for ManifestAuditor {
    fn kind(&self) -> &str {
        KIND
    }

    fn audit(&mut self, _job: &Job, audit: &Audit, files_path: &Path) -> Result<JsonValue, TaskError> {
        let ignore: Vec<String> = audit
            .options
            .as_ref()
            .and_then(|o| o.ignore.as_deref())
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let mut manifest = Manifest::default();
        walk(files_path, files_path, &ignore, &mut manifest)?;
        serde_json::to_value(&manifest).map_err(|e| TaskError::audit(KIND, e.to_string()))
    }
}

fn walk(root: &Path, dir: &Path, ignore: &[String], manifest: &mut Manifest) -> Result<(), TaskError> {
    let entries = fs::read_dir(dir).map_err(|e| TaskError::audit(KIND, format!("{}: {e}", dir.display())))?;
    for entry in entries {
        let entry = entry.map_err(|e| TaskError::audit(KIND, e.to_string()))?;
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap_or(&path).to_string_lossy();
        if ignore.iter().any(|frag| rel.contains(frag.as_str())) {
            continue;
        }

        let meta = entry.metadata().map_err(|e| TaskError::audit(KIND, e.to_string()))?;
        if meta.is_dir() {
            walk(root, &path, ignore, manifest)?;
        } else if meta.is_file() {
            manifest.files += 1;
            manifest.bytes += meta.len();
            let ext = path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            *manifest.extensions.entry(ext).or_default() += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use auditflow_core::AuditOptions;
    use serde_json::json;

    #[test]
    fn counts_files_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("vendor")).unwrap();
        fs::write(dir.path().join("a.php"), "12345").unwrap();
        fs::write(dir.path().join("b.PHP"), "1").unwrap();
        fs::write(dir.path().join("readme"), "xy").unwrap();
        fs::write(dir.path().join("vendor/lib.js"), "zzz").unwrap();

        let job = Job::new("A", "https://e", "/src", "local");
        let out = ManifestAuditor::new()
            .audit(&job, &Audit::new(KIND), dir.path())
            .unwrap();

        assert_eq!(out["files"], json!(4));
        assert_eq!(out["bytes"], json!(11));
        assert_eq!(out["extensions"]["php"], json!(2));
        assert_eq!(out["extensions"][""], json!(1));
    }

    #[test]
    fn ignore_option_skips_fragments() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("vendor")).unwrap();
        fs::write(dir.path().join("a.php"), "1").unwrap();
        fs::write(dir.path().join("vendor/lib.js"), "1").unwrap();

        let audit = Audit::new(KIND).with_options(AuditOptions {
            ignore: Some("vendor, node_modules".into()),
            ..Default::default()
        });
        let job = Job::new("A", "https://e", "/src", "local");
        let out = ManifestAuditor::new().audit(&job, &audit, dir.path()).unwrap();

        assert_eq!(out["files"], json!(1));
        assert!(out["extensions"].get("js").is_none());
    }
}
