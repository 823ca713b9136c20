use std::path::PathBuf;
use std::time::Duration;

/// Infrastructure-level failures.
///
/// A failing test run is *not* an error: it is reported as
/// [`crate::orchestrator::AttemptVerdict::TestFailure`] and drives a repair
/// attempt. Everything in here aborts the repair loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("backend error: {message}")]
    Backend {
        message: String,
        /// Exit code of a local generator process, if one was involved.
        exit_code: Option<i32>,
        /// Raw response body or stderr, kept verbatim for diagnosis.
        body: Option<String>,
    },

    #[error("{operation} timed out after {}s", after.as_secs_f64())]
    Timeout { operation: String, after: Duration },

    #[error("artifact already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("invalid workspace path `{}`: must be relative and stay inside the root", .0.display())]
    InvalidPath(PathBuf),

    #[error("execution infrastructure error: {0}")]
    ExecutionInfrastructure(String),

    #[error("failed to parse generated suite: {0}")]
    SuiteParse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Archive(#[from] zip::result::ZipError),
}

impl Error {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            exit_code: None,
            body: None,
        }
    }

    pub fn backend_with_body(message: impl Into<String>, body: impl Into<String>) -> Self {
        let body = body.into();
        Self::Backend {
            message: format!("{}: {}", message.into(), body),
            exit_code: None,
            body: Some(body),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Short machine-friendly label used in loop traces and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::Backend { .. } => "backend",
            Error::Timeout { .. } => "timeout",
            Error::AlreadyExists(_) => "already_exists",
            Error::InvalidPath(_) => "invalid_path",
            Error::ExecutionInfrastructure(_) => "execution_infrastructure",
            Error::SuiteParse(_) => "suite_parse",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Archive(_) => "archive",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
