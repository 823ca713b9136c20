//! Runs the test executor as a child process.
//!
//! A non-zero exit code is the normal "tests failed" signal and is passed
//! through untouched. Only a failure to launch, or a hang past the process
//! timeout, is an error at this layer.

use crate::artifacts::{ArtifactLayout, EXECUTOR_LOG, EXECUTOR_OUTPUTS};
use crate::config::{ExecutionConfig, ExecutorFlavor};
use crate::error::{Error, Result};
use crate::util::{command_label, run_command_with_timeout};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variable pointing the executor at the artifacts directory.
pub const ARTIFACTS_DIR_ENV: &str = "TESTLOOM_ARTIFACTS_DIR";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Reruns for flaky tests (0 disables).
    pub reruns: u32,
    /// Per-test timeout enforced by the executor.
    pub test_timeout: Option<Duration>,
    /// Worker count (0 runs serially).
    pub parallel: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub entry_paths: Vec<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub options: ExecutionOptions,
}

impl ExecutionRequest {
    /// Build the request for one attempt from the configured template.
    pub fn for_entry(template: &ExecutionConfig, entry: impl Into<PathBuf>) -> Self {
        Self {
            entry_paths: vec![entry.into()],
            env: template.env.clone(),
            options: ExecutionOptions {
                reruns: template.reruns,
                test_timeout: template.test_timeout_secs.map(Duration::from_secs),
                parallel: template.parallel,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub duration_s: f64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionOutcome {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    program: String,
    base_args: Vec<String>,
    flavor: ExecutorFlavor,
    workdir: PathBuf,
    layout: ArtifactLayout,
    process_timeout: Duration,
}

impl ExecutionEngine {
    pub fn new(
        program: impl Into<String>,
        base_args: Vec<String>,
        workdir: impl Into<PathBuf>,
        layout: ArtifactLayout,
    ) -> Self {
        Self {
            program: program.into(),
            base_args,
            flavor: ExecutorFlavor::Pytest,
            workdir: workdir.into(),
            layout,
            process_timeout: Duration::from_secs(600),
        }
    }

    pub fn from_config(
        config: &ExecutionConfig,
        workdir: impl Into<PathBuf>,
        layout: ArtifactLayout,
    ) -> Self {
        Self::new(config.program.clone(), config.args.clone(), workdir, layout)
            .flavor(config.flavor)
            .process_timeout(Duration::from_secs(config.process_timeout_secs))
    }

    pub fn flavor(mut self, flavor: ExecutorFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    pub fn process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout = timeout;
        self
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Full argument list (after the program) for `request`.
    pub fn build_args(&self, request: &ExecutionRequest, artifacts_dir: &Path) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.extend(
            request
                .entry_paths
                .iter()
                .map(|p| p.to_string_lossy().to_string()),
        );

        if self.flavor == ExecutorFlavor::Pytest {
            let at = |name: &str| artifacts_dir.join(name).to_string_lossy().to_string();
            args.extend([
                "--log-file".to_string(),
                at(EXECUTOR_LOG),
                "--log-file-level=INFO".to_string(),
                "--json-report".to_string(),
                format!("--json-report-file={}", at(crate::artifacts::REPORT_JSON)),
                format!("--junitxml={}", at(crate::artifacts::JUNIT_XML)),
                "--cov=.".to_string(),
                format!("--cov-report=xml:{}", at(crate::artifacts::COVERAGE_XML)),
                format!("--benchmark-json={}", at(crate::artifacts::BENCH_JSON)),
                "-q".to_string(),
            ]);

            let options = &request.options;
            if options.reruns > 0 {
                args.extend(["--reruns".to_string(), options.reruns.to_string()]);
            }
            if let Some(timeout) = options.test_timeout.filter(|t| !t.is_zero()) {
                args.extend(["--timeout".to_string(), timeout.as_secs().max(1).to_string()]);
            }
            if options.parallel > 0 {
                args.extend(["-n".to_string(), options.parallel.to_string()]);
            }
        }
        args
    }

    /// Run the executor once and record its output under fixed log names.
    pub fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        let artifacts_dir = std::path::absolute(self.layout.root())?;
        fs::create_dir_all(&artifacts_dir)?;
        for name in EXECUTOR_OUTPUTS {
            let stale = artifacts_dir.join(name);
            if stale.exists() {
                fs::remove_file(&stale)?;
            }
        }

        let args = self.build_args(request, &artifacts_dir);
        let label = command_label(&self.program, &args);
        info!(command = %label, cwd = %self.workdir.display(), "running test executor");

        let mut command = Command::new(&self.program);
        command
            .current_dir(&self.workdir)
            .args(&args)
            .envs(&request.env)
            .env(ARTIFACTS_DIR_ENV, &artifacts_dir);

        let result = run_command_with_timeout(&mut command, self.process_timeout, None)
            .map_err(|e| Error::ExecutionInfrastructure(format!("`{}`: {}", label, e)))?;

        fs::write(self.layout.stdout_log(), &result.stdout)?;
        fs::write(self.layout.stderr_log(), &result.stderr)?;

        if result.timed_out {
            warn!(command = %label, timeout_s = self.process_timeout.as_secs(), "test executor timed out");
            return Err(Error::timeout("test executor", self.process_timeout));
        }

        let outcome = ExecutionOutcome {
            exit_code: result.exit_code(),
            duration_s: result.elapsed.as_secs_f64(),
            stdout: result.stdout,
            stderr: result.stderr,
        };
        debug!(
            exit_code = outcome.exit_code,
            duration_s = outcome.duration_s,
            "test executor finished"
        );
        Ok(outcome)
    }
}
