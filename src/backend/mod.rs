//! Pluggable code-generation backends.
//!
//! A backend turns a `(system, task)` instruction pair into raw text. It
//! performs exactly one round trip per call and never retries; retry policy
//! belongs to the repair loop.

mod http;
mod process;
mod replay;

pub use http::{extract_generated_text, HttpBackend, EXTRACTION_STRATEGIES};
pub use process::ProcessBackend;
pub use replay::ReplayBackend;

use crate::config::BackendConfig;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// One generation call. Built fresh for every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub system_instruction: String,
    pub task_instruction: String,
}

impl GenerationRequest {
    pub fn new(system: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            system_instruction: system.into(),
            task_instruction: task.into(),
        }
    }
}

pub trait GenerationBackend: Send + Sync {
    /// Short label for logs and traces.
    fn name(&self) -> &'static str;

    /// Produce raw text for `request`. The text may wrap code in prose.
    fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

impl<B: GenerationBackend + ?Sized> GenerationBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn generate(&self, request: &GenerationRequest) -> Result<String> {
        (**self).generate(request)
    }
}

/// Build the backend described by `config`.
pub fn from_config(config: &BackendConfig) -> Result<Box<dyn GenerationBackend>> {
    Ok(match config {
        BackendConfig::Replay { fixtures } => Box::new(ReplayBackend::new(fixtures.clone())?),
        BackendConfig::Process {
            command,
            timeout_secs,
        } => Box::new(ProcessBackend::new(
            command.clone(),
            std::time::Duration::from_secs(*timeout_secs),
        )?),
        BackendConfig::Http(http) => Box::new(HttpBackend::from_config(http)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn from_config_rejects_replay_without_fixtures() {
        let err = from_config(&BackendConfig::Replay {
            fixtures: Vec::new(),
        })
        .err()
        .unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn from_config_builds_each_variant() {
        let replay = from_config(&BackendConfig::Replay {
            fixtures: vec!["fixture.txt".into()],
        })
        .unwrap();
        assert_eq!(replay.name(), "replay");

        let process = from_config(&BackendConfig::Process {
            command: vec!["cat".to_string()],
            timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(process.name(), "process");

        let http = from_config(&BackendConfig::Http(crate::config::HttpBackendConfig {
            endpoint: "http://127.0.0.1:9/v1".to_string(),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(http.name(), "http");
    }
}
