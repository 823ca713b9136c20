//! The generate → execute → diagnose → repair loop.
//!
//! Attempts are strictly sequential. A test failure consumes one attempt and
//! triggers a repair; any infrastructure error (backend, workspace, executor
//! launch, timeout) ends the run in `Error` without consuming one.

use crate::artifacts::ArtifactLayout;
use crate::backend::GenerationBackend;
use crate::collect::{ResultCollector, ResultSummary};
use crate::config::{Config, ExecutionConfig};
use crate::error::{Error, Result};
use crate::execution::{ExecutionEngine, ExecutionOutcome, ExecutionRequest};
use crate::extract::extract_code;
use crate::failure::FailureContext;
use crate::prompt::PromptBuilder;
use crate::suite::TestSuite;
use crate::util::truncate;
use crate::workspace::Workspace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest error text copied into a trace entry; the full cause stays in the status.
const TRACE_CAUSE_CHARS: usize = 600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopStatus {
    Succeeded,
    Exhausted,
    Error { kind: String, cause: String },
}

impl LoopStatus {
    fn from_error(err: &Error) -> Self {
        LoopStatus::Error {
            kind: err.kind().to_string(),
            cause: err.to_string(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LoopStatus::Succeeded => "SUCCEEDED",
            LoopStatus::Exhausted => "EXHAUSTED",
            LoopStatus::Error { .. } => "ERROR",
        }
    }
}

/// What one attempt amounted to. The retry decision is a match on this.
#[derive(Debug)]
pub enum AttemptVerdict {
    Success(ResultSummary),
    TestFailure(ResultSummary),
    Infrastructure(Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairAttempt {
    pub attempt_number: u32,
    pub outcome: ExecutionOutcome,
    /// False for the initial generation, true for every repair.
    pub repaired: bool,
    pub summary: ResultSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub attempt: u32,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopOutcome {
    pub run_id: String,
    #[serde(flatten)]
    pub status: LoopStatus,
    /// Attempts whose execution completed.
    pub attempts_used: u32,
    pub artifact_path: PathBuf,
    pub final_attempt: Option<RepairAttempt>,
    pub trace: Vec<TraceEntry>,
    pub last_stdout: String,
    pub last_stderr: String,
}

impl LoopOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == LoopStatus::Succeeded
    }
}

pub fn new_run_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S"), &id[..8])
}

/// Cumulative state of one run.
struct RunState {
    run_id: String,
    trace: Vec<TraceEntry>,
    attempts_used: u32,
    final_attempt: Option<RepairAttempt>,
}

impl RunState {
    fn note(&mut self, attempt: u32, message: impl Into<String>) {
        let message = message.into();
        debug!(run_id = %self.run_id, attempt, "{}", message);
        self.trace.push(TraceEntry {
            attempt,
            message,
            at: Utc::now(),
        });
    }
}

pub struct RepairLoop<B: GenerationBackend> {
    backend: B,
    prompts: PromptBuilder,
    workspace: Workspace,
    engine: ExecutionEngine,
    collector: ResultCollector,
    execution: ExecutionConfig,
    entry_override: Option<PathBuf>,
    max_attempts: u32,
    wall_clock_budget: Option<Duration>,
    log_tail_chars: usize,
    run_id: Option<String>,
}

impl<B: GenerationBackend> RepairLoop<B> {
    pub fn new(backend: B, workspace: Workspace, engine: ExecutionEngine) -> Self {
        let collector = ResultCollector::new(engine.layout().clone());
        Self {
            backend,
            prompts: PromptBuilder::default(),
            workspace,
            engine,
            collector,
            execution: ExecutionConfig::default(),
            entry_override: None,
            max_attempts: 3,
            wall_clock_budget: None,
            log_tail_chars: crate::config::DEFAULT_LOG_TAIL_CHARS,
            run_id: None,
        }
    }

    /// Wire up workspace, engine and budgets from `config`.
    pub fn from_config(backend: B, config: &Config) -> Result<Self> {
        config.validate()?;
        let workspace = Workspace::new(&config.workspace.root);
        let layout = ArtifactLayout::new(config.workspace.artifacts_root());
        let engine =
            ExecutionEngine::from_config(&config.execution, &config.workspace.root, layout);

        let mut repair_loop = Self::new(backend, workspace, engine)
            .prompts(PromptBuilder::from_config(&config.repair)?)
            .execution_template(config.execution.clone())
            .max_attempts(config.repair.max_attempts)
            .log_tail_chars(config.repair.log_tail_chars);
        repair_loop.wall_clock_budget = config
            .repair
            .wall_clock_budget_secs
            .map(Duration::from_secs);
        repair_loop.entry_override = config.workspace.entry_point.clone();
        Ok(repair_loop)
    }

    pub fn prompts(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn execution_template(mut self, template: ExecutionConfig) -> Self {
        self.execution = template;
        self
    }

    pub fn entry_point(mut self, entry: impl Into<PathBuf>) -> Self {
        self.entry_override = Some(entry.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn wall_clock_budget(mut self, budget: Duration) -> Self {
        self.wall_clock_budget = Some(budget);
        self
    }

    pub fn log_tail_chars(mut self, chars: usize) -> Self {
        self.log_tail_chars = chars;
        self
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn collector(&self) -> &ResultCollector {
        &self.collector
    }

    fn entry_for(&self, suite: &TestSuite) -> PathBuf {
        self.entry_override
            .clone()
            .unwrap_or_else(|| suite.entry_point())
    }

    /// Generate and write the entry artifact once, without executing it.
    pub fn generate_only(&self, suite: &TestSuite) -> Result<PathBuf> {
        let _lock = self.workspace.lock()?;
        let entry = self.entry_for(suite);
        let raw = self.backend.generate(&self.prompts.generation(suite))?;
        let path = self.workspace.write(&entry, &extract_code(&raw), true)?;
        info!(path = %path.display(), backend = self.backend.name(), "generated test file");
        Ok(path)
    }

    /// Drive the loop to a terminal state. Never returns an error: failures
    /// are reported through `LoopOutcome::status`.
    pub fn run(&self, suite: &TestSuite) -> LoopOutcome {
        let run_id = self.run_id.clone().unwrap_or_else(new_run_id);
        let entry = self.entry_for(suite);
        let artifact_path = self.workspace.root().join(&entry);
        let mut state = RunState {
            run_id: run_id.clone(),
            trace: Vec::new(),
            attempts_used: 0,
            final_attempt: None,
        };

        info!(
            run_id = %run_id,
            suite = suite.label(),
            backend = self.backend.name(),
            max_attempts = self.max_attempts,
            "starting repair loop"
        );

        let status = match self.workspace.lock() {
            Ok(_lock) => self.drive(suite, &entry, &mut state),
            Err(err) => {
                state.note(
                    0,
                    format!("aborted: {}", truncate(&err.to_string(), TRACE_CAUSE_CHARS)),
                );
                LoopStatus::from_error(&err)
            }
        };

        let attempts = state.attempts_used;
        match &status {
            LoopStatus::Error { kind, cause } => error!(
                run_id = %run_id,
                attempts,
                kind = %kind,
                status = status.label(),
                "repair loop aborted: {}",
                cause
            ),
            LoopStatus::Exhausted => {
                warn!(run_id = %run_id, attempts, status = status.label(), "repair loop finished")
            }
            LoopStatus::Succeeded => {
                info!(run_id = %run_id, attempts, status = status.label(), "repair loop finished")
            }
        }

        let (last_stdout, last_stderr) = state
            .final_attempt
            .as_ref()
            .map(|a| (a.outcome.stdout.clone(), a.outcome.stderr.clone()))
            .unwrap_or_default();

        LoopOutcome {
            run_id,
            status,
            attempts_used: state.attempts_used,
            artifact_path,
            final_attempt: state.final_attempt,
            trace: state.trace,
            last_stdout,
            last_stderr,
        }
    }

    fn drive(&self, suite: &TestSuite, entry: &Path, state: &mut RunState) -> LoopStatus {
        let started = Instant::now();

        for attempt in 1..=self.max_attempts {
            if let Some(budget) = self.wall_clock_budget {
                if started.elapsed() >= budget {
                    state.note(
                        attempt,
                        format!(
                            "wall-clock budget of {:.1}s exhausted; attempt not started",
                            budget.as_secs_f64()
                        ),
                    );
                    return LoopStatus::Exhausted;
                }
            }

            match self.attempt(attempt, suite, entry, state) {
                AttemptVerdict::Success(_) => {
                    state.note(attempt, "tests passed");
                    return LoopStatus::Succeeded;
                }
                AttemptVerdict::TestFailure(summary) => {
                    let t = summary.totals;
                    if attempt == self.max_attempts {
                        state.note(
                            attempt,
                            format!(
                                "still failing ({} of {} tests failed); no attempts left",
                                t.failed, t.total
                            ),
                        );
                        return LoopStatus::Exhausted;
                    }
                    state.note(
                        attempt,
                        format!(
                            "{} of {} tests failed (exit code {}); requesting repair",
                            t.failed, t.total, summary.exit_code
                        ),
                    );
                }
                AttemptVerdict::Infrastructure(err) => {
                    state.note(
                        attempt,
                        format!("aborted: {}", truncate(&err.to_string(), TRACE_CAUSE_CHARS)),
                    );
                    return LoopStatus::from_error(&err);
                }
            }
        }
        LoopStatus::Exhausted
    }

    fn attempt(
        &self,
        attempt: u32,
        suite: &TestSuite,
        entry: &Path,
        state: &mut RunState,
    ) -> AttemptVerdict {
        match self.execute_attempt(attempt, suite, entry, state) {
            Ok(record) => {
                let summary = record.summary.clone();
                let passed = record.outcome.passed();
                state.final_attempt = Some(record);
                if passed {
                    AttemptVerdict::Success(summary)
                } else {
                    AttemptVerdict::TestFailure(summary)
                }
            }
            Err(err) => AttemptVerdict::Infrastructure(err),
        }
    }

    fn execute_attempt(
        &self,
        attempt: u32,
        suite: &TestSuite,
        entry: &Path,
        state: &mut RunState,
    ) -> Result<RepairAttempt> {
        let repaired = attempt > 1;
        let current = self.workspace.read(entry)?.unwrap_or_default();

        let request = if repaired {
            let failure = FailureContext::collect(self.engine.layout(), self.log_tail_chars);
            state.note(attempt, "requesting repair from backend");
            self.prompts.repair(suite, &current, &failure)
        } else {
            state.note(attempt, "requesting test file from backend");
            self.prompts.generation(suite)
        };

        info!(run_id = %state.run_id, attempt, backend = self.backend.name(), "calling generation backend");
        let raw = self.backend.generate(&request)?;
        let code = extract_code(&raw);
        let path = self.workspace.write(entry, &code, true)?;
        state.note(
            attempt,
            format!("wrote {} ({} bytes)", path.display(), code.len()),
        );

        let exec_request = ExecutionRequest::for_entry(&self.execution, entry);
        let outcome = self.engine.execute(&exec_request)?;
        state.attempts_used = attempt;
        info!(
            run_id = %state.run_id,
            attempt,
            exit_code = outcome.exit_code,
            duration_s = outcome.duration_s,
            "executor finished"
        );

        let mut summary =
            self.collector
                .summarize(&state.run_id, outcome.duration_s, outcome.exit_code);
        match self.collector.bundle(&state.run_id) {
            Ok(bundle) => {
                summary
                    .artifact_paths
                    .insert("bundle_zip".to_string(), bundle);
            }
            Err(err) => warn!(run_id = %state.run_id, attempt, error = %err, "could not bundle artifacts"),
        }
        self.collector.write_summary(&summary)?;

        let t = summary.totals;
        state.note(
            attempt,
            format!(
                "executor exited with code {} after {:.2}s: {} passed, {} failed, {} skipped",
                outcome.exit_code, outcome.duration_s, t.passed, t.failed, t.skipped
            ),
        );
        if let Some(reason) = &summary.report_error {
            state.note(attempt, format!("test report unreadable: {}", reason));
        }

        Ok(RepairAttempt {
            attempt_number: attempt,
            outcome,
            repaired,
            summary,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backend::{GenerationRequest, ReplayBackend};
    use crate::config::ExecutorFlavor;
    use std::fs;
    use tempfile::tempdir;

    /// Executor that passes iff the entry file contains "PASS".
    fn grep_engine(root: &Path) -> ExecutionEngine {
        ExecutionEngine::new(
            "sh",
            vec![
                "-c".to_string(),
                "grep -q PASS \"$0\" && echo ok || { echo 'assert failed' >&2; exit 1; }"
                    .to_string(),
            ],
            root,
            ArtifactLayout::new(root.join("artifacts")),
        )
        .flavor(ExecutorFlavor::Plain)
    }

    fn fixtures(dir: &Path, bodies: &[&str]) -> ReplayBackend {
        let paths = bodies
            .iter()
            .enumerate()
            .map(|(i, body)| {
                let p = dir.join(format!("fixture_{}.txt", i));
                fs::write(&p, body).unwrap();
                p
            })
            .collect();
        ReplayBackend::new(paths).unwrap()
    }

    struct Failing;

    impl GenerationBackend for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn generate(&self, _request: &GenerationRequest) -> Result<String> {
            Err(Error::backend("HTTP 500: upstream down"))
        }
    }

    #[test]
    fn repairs_until_tests_pass() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("work");
        let backend = fixtures(dir.path(), &["```python\nFAIL\n```", "```python\nPASS\n```"]);
        let repair_loop = RepairLoop::new(backend, Workspace::new(&work), grep_engine(&work))
            .run_id("run-ok")
            .max_attempts(3);

        let outcome = repair_loop.run(&TestSuite::default());
        assert_eq!(outcome.status, LoopStatus::Succeeded);
        assert_eq!(outcome.attempts_used, 2);
        assert_eq!(repair_loop.backend().calls(), 2);
        assert_eq!(fs::read_to_string(&outcome.artifact_path).unwrap(), "PASS");
        assert_eq!(outcome.last_stdout.trim(), "ok");

        let last = outcome.final_attempt.unwrap();
        assert!(last.repaired);
        assert_eq!(
            last.summary.artifact_paths.get("bundle_zip"),
            Some(&work.join("artifacts/bundle_run-ok.zip"))
        );
        assert!(outcome.trace.iter().any(|t| t.attempt == 1));
        assert!(outcome.trace.iter().any(|t| t.attempt == 2));
    }

    #[test]
    fn exhausts_budget_without_extra_attempt() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("work");
        let backend = fixtures(dir.path(), &["FAIL"]);
        let repair_loop =
            RepairLoop::new(backend, Workspace::new(&work), grep_engine(&work)).max_attempts(2);

        let outcome = repair_loop.run(&TestSuite::default());
        assert_eq!(outcome.status, LoopStatus::Exhausted);
        assert_eq!(outcome.attempts_used, 2);
        assert_eq!(repair_loop.backend().calls(), 2);
        assert_eq!(outcome.last_stderr.trim(), "assert failed");
    }

    #[test]
    fn backend_error_aborts_without_consuming_attempts() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("work");
        let repair_loop = RepairLoop::new(Failing, Workspace::new(&work), grep_engine(&work));

        let outcome = repair_loop.run(&TestSuite::default());
        match &outcome.status {
            LoopStatus::Error { kind, cause } => {
                assert_eq!(kind, "backend");
                assert!(cause.contains("upstream down"));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(outcome.attempts_used, 0);
        assert!(outcome.final_attempt.is_none());
        assert!(!outcome.artifact_path.exists());
    }

    #[test]
    fn zero_wall_clock_budget_starts_nothing() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("work");
        let backend = fixtures(dir.path(), &["PASS"]);
        let repair_loop = RepairLoop::new(backend, Workspace::new(&work), grep_engine(&work))
            .wall_clock_budget(Duration::ZERO);

        let outcome = repair_loop.run(&TestSuite::default());
        assert_eq!(outcome.status, LoopStatus::Exhausted);
        assert_eq!(outcome.attempts_used, 0);
        assert_eq!(repair_loop.backend().calls(), 0);
        assert!(outcome.trace[0].message.contains("wall-clock budget"));
    }

    #[test]
    fn missing_executor_is_an_infrastructure_error() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("work");
        let backend = fixtures(dir.path(), &["PASS"]);
        let engine = ExecutionEngine::new(
            "testloom-missing-executor",
            vec![],
            &work,
            ArtifactLayout::new(work.join("artifacts")),
        );
        let outcome = RepairLoop::new(backend, Workspace::new(&work), engine).run(&TestSuite::default());
        assert!(matches!(
            outcome.status,
            LoopStatus::Error { ref kind, .. } if kind == "execution_infrastructure"
        ));
        assert_eq!(outcome.attempts_used, 0);
    }

    #[test]
    fn executor_timeout_is_an_error_without_consuming_an_attempt() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("work");
        let backend = fixtures(dir.path(), &["PASS"]);
        let engine = ExecutionEngine::new(
            "sh",
            vec!["-c".to_string(), "sleep 5; echo late".to_string()],
            &work,
            ArtifactLayout::new(work.join("artifacts")),
        )
        .flavor(ExecutorFlavor::Plain)
        .process_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let outcome = RepairLoop::new(backend, Workspace::new(&work), engine)
            .max_attempts(3)
            .run(&TestSuite::default());
        assert!(matches!(
            outcome.status,
            LoopStatus::Error { ref kind, .. } if kind == "timeout"
        ));
        assert_eq!(outcome.attempts_used, 0);
        assert!(outcome.final_attempt.is_none());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn outcome_serializes_with_flat_status() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("work");
        let outcome = RepairLoop::new(Failing, Workspace::new(&work), grep_engine(&work))
            .run(&TestSuite::default());
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "ERROR");
        assert_eq!(json["kind"], "backend");
        assert_eq!(json["attempts_used"], 0);
    }

    #[test]
    fn generate_only_writes_without_executing() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("work");
        let backend = fixtures(dir.path(), &["```py\nPASS\n```"]);
        let repair_loop = RepairLoop::new(backend, Workspace::new(&work), grep_engine(&work))
            .entry_point("tests/test_x.py");
        let path = repair_loop.generate_only(&TestSuite::default()).unwrap();
        assert_eq!(path, work.join("tests/test_x.py"));
        assert_eq!(fs::read_to_string(path).unwrap(), "PASS");
        assert!(!work.join("artifacts").exists());
    }

    /// Records every system instruction it is sent.
    #[derive(Default)]
    struct Recording {
        systems: std::sync::Mutex<Vec<String>>,
    }

    impl GenerationBackend for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn generate(&self, request: &GenerationRequest) -> Result<String> {
            if let Ok(mut systems) = self.systems.lock() {
                systems.push(request.system_instruction.clone());
            }
            Ok("PASS".to_string())
        }
    }

    #[test]
    fn from_config_applies_system_guide() {
        let dir = tempdir().unwrap();
        let guide = dir.path().join("guide.txt");
        fs::write(&guide, "only the requests library").unwrap();
        let mut config = Config::default();
        config.workspace.root = dir.path().join("work");
        config.backend = crate::config::BackendConfig::Replay {
            fixtures: vec![guide.clone()],
        };
        config.repair.system_guide = Some(guide);

        let repair_loop = RepairLoop::from_config(Recording::default(), &config).unwrap();
        repair_loop.generate_only(&TestSuite::default()).unwrap();
        let systems = repair_loop.backend().systems.lock().unwrap();
        assert_eq!(systems.as_slice(), ["only the requests library".to_string()]);

        config.repair.system_guide = Some(dir.path().join("missing.txt"));
        assert!(matches!(
            RepairLoop::from_config(Recording::default(), &config),
            Err(Error::Configuration(_))
        ));
    }
}
