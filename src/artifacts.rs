//! Fixed artifact file names under the artifacts root.
//!
//! Names never depend on the attempt number, so each execution overwrites
//! the previous one's reports. Only bundles are keyed (by run id).

use std::path::{Path, PathBuf};

pub const REPORT_JSON: &str = "report.json";
pub const JUNIT_XML: &str = "junit.xml";
pub const COVERAGE_XML: &str = "coverage.xml";
pub const BENCH_JSON: &str = "bench.json";
pub const STDOUT_LOG: &str = "pytest_stdout.log";
pub const STDERR_LOG: &str = "pytest_stderr.log";
pub const EXECUTOR_LOG: &str = "pytest.log";
pub const SUMMARY_JSON: &str = "summary.json";

const BUNDLE_PREFIX: &str = "bundle_";
const BUNDLE_SUFFIX: &str = ".zip";

/// Logical artifact names, as reported in `ResultSummary::artifact_paths`.
pub const NAMED_ARTIFACTS: &[(&str, &str)] = &[
    ("json_report", REPORT_JSON),
    ("junit_xml", JUNIT_XML),
    ("coverage_xml", COVERAGE_XML),
    ("bench_json", BENCH_JSON),
    ("stdout", STDOUT_LOG),
    ("stderr", STDERR_LOG),
    ("executor_log", EXECUTOR_LOG),
];

/// Files produced by the test executor itself; cleared before each run so a
/// crashed executor cannot leave the previous attempt's report behind.
pub const EXECUTOR_OUTPUTS: &[&str] = &[
    REPORT_JSON,
    JUNIT_XML,
    COVERAGE_XML,
    BENCH_JSON,
    EXECUTOR_LOG,
    SUMMARY_JSON,
];

#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    pub fn report_json(&self) -> PathBuf {
        self.path(REPORT_JSON)
    }

    pub fn stdout_log(&self) -> PathBuf {
        self.path(STDOUT_LOG)
    }

    pub fn stderr_log(&self) -> PathBuf {
        self.path(STDERR_LOG)
    }

    pub fn summary_json(&self) -> PathBuf {
        self.path(SUMMARY_JSON)
    }

    pub fn bundle(&self, run_id: &str) -> PathBuf {
        self.path(&bundle_file_name(run_id))
    }
}

pub fn bundle_file_name(run_id: &str) -> String {
    let safe: String = run_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}{}{}", BUNDLE_PREFIX, safe, BUNDLE_SUFFIX)
}

pub fn is_bundle_file(file_name: &str) -> bool {
    file_name.starts_with(BUNDLE_PREFIX) && file_name.ends_with(BUNDLE_SUFFIX)
}
