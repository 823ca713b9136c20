//! Gathers what a repair prompt needs to know about the previous attempt.

use crate::artifacts::{
    ArtifactLayout, BENCH_JSON, COVERAGE_XML, EXECUTOR_LOG, JUNIT_XML, STDERR_LOG, STDOUT_LOG,
};
use crate::collect::{ResultCollector, ResultSummary};
use crate::util::tail_chars;
use std::collections::BTreeMap;
use std::fs;

/// Log sources included in the context, by logical name.
pub const CONTEXT_LOGS: &[(&str, &str)] = &[
    ("stdout", STDOUT_LOG),
    ("stderr", STDERR_LOG),
    ("executor_log", EXECUTOR_LOG),
    ("junit_xml", JUNIT_XML),
    ("coverage_xml", COVERAGE_XML),
    ("bench_json", BENCH_JSON),
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailureContext {
    pub summary: Option<ResultSummary>,
    /// Logical name -> tail of the file; empty when the file is missing.
    pub logs: BTreeMap<String, String>,
}

impl FailureContext {
    /// Read the latest summary and log tails. Never fails.
    pub fn collect(layout: &ArtifactLayout, tail: usize) -> Self {
        let summary = ResultCollector::new(layout.clone()).read_summary();
        let logs = CONTEXT_LOGS
            .iter()
            .map(|(name, file)| {
                let text = fs::read_to_string(layout.path(file))
                    .map(|s| tail_chars(&s, tail))
                    .unwrap_or_default();
                (name.to_string(), text)
            })
            .collect();
        Self { summary, logs }
    }

    pub fn log(&self, name: &str) -> &str {
        self.logs.get(name).map(String::as_str).unwrap_or_default()
    }

    /// Summary as pretty JSON, or `{}` when none was recorded.
    pub fn summary_json(&self) -> String {
        self.summary
            .as_ref()
            .and_then(|s| serde_json::to_string_pretty(s).ok())
            .unwrap_or_else(|| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_artifacts_give_empty_context() {
        let dir = tempdir().unwrap();
        let ctx = FailureContext::collect(&ArtifactLayout::new(dir.path().join("none")), 100);
        assert!(ctx.summary.is_none());
        assert_eq!(ctx.logs.len(), CONTEXT_LOGS.len());
        assert!(ctx.logs.values().all(String::is_empty));
        assert_eq!(ctx.summary_json(), "{}");
    }

    #[test]
    fn logs_are_tailed_and_summary_is_loaded() {
        let dir = tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        fs::write(layout.stdout_log(), "0123456789").unwrap();
        fs::write(layout.stderr_log(), "short").unwrap();
        let collector = ResultCollector::new(layout.clone());
        let summary = collector.summarize("run-9", 0.5, 1);
        collector.write_summary(&summary).unwrap();

        let ctx = FailureContext::collect(&layout, 4);
        assert_eq!(ctx.log("stdout"), "6789");
        assert_eq!(ctx.log("stderr"), "hort");
        assert_eq!(ctx.log("coverage_xml"), "");
        assert_eq!(ctx.summary.as_ref().map(|s| s.run_id.as_str()), Some("run-9"));
        assert!(ctx.summary_json().contains("\"exit_code\": 1"));
    }
}
