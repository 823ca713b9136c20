use super::{GenerationBackend, GenerationRequest};
use crate::error::{Error, Result};
use crate::util::{command_label, run_command_with_timeout};
use serde::Serialize;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

/// Local generator process.
///
/// Receives `{"system": ..., "user": ...}` on stdin, answers on stdout and
/// exits. A non-zero exit is a hard failure.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    command: Vec<String>,
    timeout: Duration,
}

#[derive(Serialize)]
struct ProcessPayload<'a> {
    system: &'a str,
    user: &'a str,
}

impl ProcessBackend {
    pub fn new(command: Vec<String>, timeout: Duration) -> Result<Self> {
        if command.is_empty() || command[0].trim().is_empty() {
            return Err(Error::Configuration(
                "process backend requires a command".to_string(),
            ));
        }
        Ok(Self { command, timeout })
    }
}

impl GenerationBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let payload = serde_json::to_vec(&ProcessPayload {
            system: &request.system_instruction,
            user: &request.task_instruction,
        })?;

        let (program, args) = self.command.split_first().ok_or_else(|| {
            Error::Configuration("process backend requires a command".to_string())
        })?;
        let label = command_label(program, args);
        debug!(command = %label, bytes = payload.len(), "invoking generator process");

        let mut cmd = Command::new(program);
        cmd.args(args);
        let result = run_command_with_timeout(&mut cmd, self.timeout, Some(&payload))
            .map_err(|e| Error::backend(format!("generator `{}`: {}", label, e)))?;

        if result.timed_out {
            warn!(command = %label, "generator process timed out");
            return Err(Error::timeout(format!("generator `{}`", label), self.timeout));
        }

        let exit_code = result.exit_code();
        if exit_code != 0 {
            return Err(Error::Backend {
                message: format!(
                    "generator `{}` exited with code {}: {}",
                    label,
                    exit_code,
                    result.stderr.trim()
                ),
                exit_code: Some(exit_code),
                body: Some(result.stderr),
            });
        }

        Ok(result.stdout)
    }
}
