//! Normalizes the executor's JSON report into a `ResultSummary` and packs
//! the artifacts directory into a per-run zip bundle.

use crate::artifacts::{is_bundle_file, ArtifactLayout, NAMED_ARTIFACTS};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub node_id: String,
    pub outcome: String,
    pub line: Option<u64>,
    pub duration: Option<f64>,
    pub long_representation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub run_id: String,
    pub duration_s: f64,
    pub exit_code: i32,
    pub totals: Totals,
    pub failures: Vec<FailureDetail>,
    /// Logical artifact name -> path, for artifacts present on disk.
    pub artifact_paths: BTreeMap<String, PathBuf>,
    /// Why the report could not be parsed, when it exists but is malformed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_error: Option<String>,
}

impl ResultSummary {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Passed,
    Failed,
    Skipped,
}

fn bucket(outcome: &str) -> Bucket {
    match outcome {
        "passed" | "xpassed" => Bucket::Passed,
        "skipped" | "xfailed" | "deselected" => Bucket::Skipped,
        _ => Bucket::Failed,
    }
}

#[derive(Debug, Clone)]
pub struct ResultCollector {
    layout: ArtifactLayout,
}

impl ResultCollector {
    pub fn new(layout: ArtifactLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Build the summary for the latest execution.
    ///
    /// Never fails: an absent report yields empty totals, a malformed one
    /// additionally sets `report_error`.
    pub fn summarize(&self, run_id: &str, duration_s: f64, exit_code: i32) -> ResultSummary {
        let mut summary = ResultSummary {
            run_id: run_id.to_string(),
            duration_s,
            exit_code,
            totals: Totals::default(),
            failures: Vec::new(),
            artifact_paths: self.present_artifacts(),
            report_error: None,
        };

        let report_path = self.layout.report_json();
        match fs::read_to_string(&report_path) {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(report) if !report.is_object() => {
                    warn!(path = %report_path.display(), "test report is not a JSON object");
                    summary.report_error = Some("report is not a JSON object".to_string());
                }
                Ok(report) => {
                    let (totals, failures) = parse_report(&report);
                    summary.totals = totals;
                    summary.failures = failures;
                }
                Err(e) => {
                    warn!(path = %report_path.display(), error = %e, "malformed test report");
                    summary.report_error = Some(e.to_string());
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %report_path.display(), "no test report produced");
            }
            Err(e) => {
                warn!(path = %report_path.display(), error = %e, "unreadable test report");
                summary.report_error = Some(e.to_string());
            }
        }
        summary
    }

    /// Persist `summary` next to the other artifacts.
    pub fn write_summary(&self, summary: &ResultSummary) -> Result<PathBuf> {
        let path = self.layout.summary_json();
        fs::create_dir_all(self.layout.root())?;
        fs::write(&path, serde_json::to_string_pretty(summary)?)?;
        Ok(path)
    }

    pub fn read_summary(&self) -> Option<ResultSummary> {
        let text = fs::read_to_string(self.layout.summary_json()).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Zip every file under the artifacts root into `bundle_<run_id>.zip`.
    ///
    /// Existing bundles are excluded, so bundling twice with no intervening
    /// writes produces the same membership.
    pub fn bundle(&self, run_id: &str) -> Result<PathBuf> {
        let root = self.layout.root();
        fs::create_dir_all(root)?;
        let target = self.layout.bundle(run_id);
        let staging = target.with_file_name(format!(
            "{}.tmp",
            target
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        ));

        let mut entries: Vec<(String, PathBuf)> = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy();
                !is_bundle_file(&name) && !name.ends_with(".tmp")
            })
            .filter_map(|entry| {
                let rel = entry.path().strip_prefix(root).ok()?;
                Some((archive_name(rel), entry.path().to_path_buf()))
            })
            .collect();
        entries.sort();

        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut writer = ZipWriter::new(File::create(&staging)?);
        let mut buf = Vec::new();
        for (name, path) in &entries {
            buf.clear();
            File::open(path)?.read_to_end(&mut buf)?;
            writer.start_file(name.as_str(), options)?;
            writer.write_all(&buf)?;
        }
        writer.finish()?;
        fs::rename(&staging, &target)?;

        debug!(bundle = %target.display(), files = entries.len(), "wrote artifact bundle");
        Ok(target)
    }

    fn present_artifacts(&self) -> BTreeMap<String, PathBuf> {
        NAMED_ARTIFACTS
            .iter()
            .map(|(name, file)| (*name, self.layout.path(file)))
            .filter(|(_, path)| path.exists())
            .map(|(name, path)| (name.to_string(), path))
            .collect()
    }
}

fn archive_name(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn parse_report(report: &Value) -> (Totals, Vec<FailureDetail>) {
    let mut totals = Totals::default();
    let mut failures = Vec::new();

    let tests = report
        .get("tests")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for test in tests {
        let outcome = test
            .get("outcome")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        totals.total += 1;
        match bucket(outcome) {
            Bucket::Passed => totals.passed += 1,
            Bucket::Skipped => totals.skipped += 1,
            Bucket::Failed => {
                totals.failed += 1;
                failures.push(failure_detail(test, outcome));
            }
        }
    }
    (totals, failures)
}

fn failure_detail(test: &Value, outcome: &str) -> FailureDetail {
    let node_id = test
        .get("nodeid")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let line = test.get("lineno").and_then(Value::as_u64);

    let phases = ["call", "setup", "teardown"];
    let duration = phases
        .iter()
        .find_map(|p| test.get(*p)?.get("duration")?.as_f64());
    let long_representation = phases.iter().find_map(|p| {
        let phase = test.get(*p)?;
        phase
            .get("longrepr")
            .and_then(render_repr)
            .or_else(|| phase.get("crash").and_then(render_repr))
    });

    FailureDetail {
        node_id,
        outcome: outcome.to_string(),
        line,
        duration,
        long_representation,
    }
}

fn render_repr(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) if map.is_empty() => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn collector(root: &Path) -> ResultCollector {
        ResultCollector::new(ArtifactLayout::new(root.join("artifacts")))
    }

    const REPORT: &str = r#"{
        "tests": [
            {"nodeid": "tests/test_a.py::test_ok", "lineno": 3, "outcome": "passed",
             "call": {"duration": 0.01}},
            {"nodeid": "tests/test_a.py::test_bad", "lineno": 9, "outcome": "failed",
             "call": {"duration": 0.5, "longrepr": "assert 1 == 2"}},
            {"nodeid": "tests/test_a.py::test_crash", "lineno": 14, "outcome": "failed",
             "call": {"duration": 0.2, "crash": {"path": "t.py", "lineno": 15, "message": "boom"}}},
            {"nodeid": "tests/test_a.py::test_skip", "lineno": 20, "outcome": "skipped"},
            {"nodeid": "tests/test_a.py::test_err", "lineno": 25, "outcome": "error",
             "setup": {"duration": 0.1, "longrepr": "fixture 'client' not found"}}
        ]
    }"#;

    #[test]
    fn summarizes_report_and_keeps_totals_consistent() {
        let dir = tempdir().unwrap();
        let c = collector(dir.path());
        fs::create_dir_all(c.layout().root()).unwrap();
        fs::write(c.layout().report_json(), REPORT).unwrap();

        let summary = c.summarize("run-1", 1.25, 1);
        assert_eq!(
            summary.totals,
            Totals {
                total: 5,
                passed: 1,
                failed: 3,
                skipped: 1
            }
        );
        let t = summary.totals;
        assert_eq!(t.total, t.passed + t.failed + t.skipped);

        let bad = &summary.failures[0];
        assert_eq!(bad.node_id, "tests/test_a.py::test_bad");
        assert_eq!(bad.line, Some(9));
        assert_eq!(bad.duration, Some(0.5));
        assert_eq!(bad.long_representation.as_deref(), Some("assert 1 == 2"));

        let crash = summary.failures[1].long_representation.as_deref().unwrap();
        assert!(crash.contains("boom"));

        let err = &summary.failures[2];
        assert_eq!(err.outcome, "error");
        assert_eq!(
            err.long_representation.as_deref(),
            Some("fixture 'client' not found")
        );
        assert!(summary.artifact_paths.contains_key("json_report"));
        assert!(summary.report_error.is_none());
    }

    #[test]
    fn absent_report_degrades_to_empty_summary() {
        let dir = tempdir().unwrap();
        let summary = collector(dir.path()).summarize("run-2", 0.3, 2);
        assert_eq!(summary.totals, Totals::default());
        assert!(summary.failures.is_empty());
        assert!(summary.artifact_paths.is_empty());
        assert_eq!(summary.exit_code, 2);
        assert!(summary.report_error.is_none());
    }

    #[test]
    fn malformed_report_is_flagged_not_fatal() {
        let dir = tempdir().unwrap();
        let c = collector(dir.path());
        fs::create_dir_all(c.layout().root()).unwrap();
        fs::write(c.layout().report_json(), "{\"tests\": [").unwrap();

        let summary = c.summarize("run-3", 0.0, 1);
        assert_eq!(summary.totals.total, 0);
        assert!(summary.report_error.is_some());
        assert!(summary.artifact_paths.contains_key("json_report"));
    }

    #[test]
    fn summary_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let c = collector(dir.path());
        assert!(c.read_summary().is_none());
        let summary = c.summarize("run-4", 0.1, 0);
        c.write_summary(&summary).unwrap();
        assert_eq!(c.read_summary(), Some(summary));
    }

    fn members(path: &Path) -> Vec<(String, u64)> {
        let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        (0..archive.len())
            .map(|i| {
                let f = archive.by_index(i).unwrap();
                (f.name().to_string(), f.size())
            })
            .collect()
    }

    #[test]
    fn bundle_membership_is_stable_and_excludes_bundles() {
        let dir = tempdir().unwrap();
        let c = collector(dir.path());
        let root = c.layout().root().to_path_buf();
        fs::create_dir_all(root.join("nested")).unwrap();
        fs::write(root.join("report.json"), "{}").unwrap();
        fs::write(root.join("pytest_stdout.log"), "1 failed").unwrap();
        fs::write(root.join("nested/extra.txt"), "x").unwrap();

        let first = c.bundle("r1").unwrap();
        assert_eq!(first, root.join("bundle_r1.zip"));
        let second = c.bundle("r2").unwrap();

        let expected = vec![
            ("nested/extra.txt".to_string(), 1),
            ("pytest_stdout.log".to_string(), 8),
            ("report.json".to_string(), 2),
        ];
        assert_eq!(members(&first), expected);
        assert_eq!(members(&second), expected);
        assert!(!root.join("bundle_r2.zip.tmp").exists());
    }
}
