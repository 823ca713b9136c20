//! Configuration for testloom
//!
//! Read from a TOML file (`--config`), or from
//! `~/.config/testloom/config.toml` when present. Every field has a default
//! so a minimal file only needs a `[backend]` table.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_ENTRY_POINT: &str = "tests/test_generated.py";
pub const DEFAULT_API_KEY_ENV: &str = "LLM_API_KEY";
pub const DEFAULT_HTTP_TIMEOUT_SECS: f64 = 60.0;
pub const MAX_HTTP_TIMEOUT_SECS: f64 = 86_400.0;
pub const DEFAULT_LOG_TAIL_CHARS: usize = 4_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub workspace: WorkspaceConfig,
    pub backend: BackendConfig,
    pub execution: ExecutionConfig,
    pub repair: RepairConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Directory generated tests are written under and the executor runs in.
    pub root: PathBuf,
    /// Artifacts directory; relative values are resolved against `root`.
    pub artifacts_dir: PathBuf,
    /// Overrides the entry point named by the suite.
    pub entry_point: Option<PathBuf>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            artifacts_dir: PathBuf::from("artifacts"),
            entry_point: None,
        }
    }
}

impl WorkspaceConfig {
    pub fn artifacts_root(&self) -> PathBuf {
        if self.artifacts_dir.is_absolute() {
            self.artifacts_dir.clone()
        } else {
            self.root.join(&self.artifacts_dir)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Replays fixture files in order; the last one repeats.
    Replay {
        #[serde(default)]
        fixtures: Vec<PathBuf>,
    },
    /// Local generator speaking JSON on stdin, text on stdout.
    Process {
        #[serde(default)]
        command: Vec<String>,
        #[serde(default = "default_process_timeout_secs")]
        timeout_secs: u64,
    },
    Http(HttpBackendConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Replay {
            fixtures: Vec::new(),
        }
    }
}

/// Request-body shape for the HTTP backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestSchema {
    /// `{"messages": [{"role": ..., "content": ...}]}`
    #[default]
    #[serde(alias = "openai")]
    Chat,
    /// `{"system": ..., "user": ...}`
    Simple,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpBackendConfig {
    pub endpoint: String,
    pub model: Option<String>,
    pub schema: RequestSchema,
    /// Explicit key; takes precedence over `api_key_env`.
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub headers: BTreeMap<String, String>,
    pub timeout_secs: f64,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model: None,
            schema: RequestSchema::Chat,
            api_key: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            headers: BTreeMap::new(),
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl HttpBackendConfig {
    /// Explicit key first, then the named environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                if self.api_key_env.is_empty() {
                    return None;
                }
                std::env::var(&self.api_key_env)
                    .ok()
                    .filter(|k| !k.trim().is_empty())
            })
    }

    /// Request timeout; values `validate` would reject fall back to the default.
    pub fn timeout(&self) -> Duration {
        if !self.timeout_secs.is_finite() || self.timeout_secs > MAX_HTTP_TIMEOUT_SECS {
            return Duration::from_secs_f64(DEFAULT_HTTP_TIMEOUT_SECS);
        }
        Duration::from_secs_f64(self.timeout_secs.max(0.001))
    }
}

/// How the test executor is asked to produce its reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorFlavor {
    /// pytest with json-report, junitxml, cov and benchmark plugins.
    #[default]
    Pytest,
    /// Entry paths only; the executor reads `TESTLOOM_ARTIFACTS_DIR`.
    Plain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub program: String,
    pub args: Vec<String>,
    pub flavor: ExecutorFlavor,
    pub reruns: u32,
    pub test_timeout_secs: Option<u64>,
    pub parallel: u32,
    /// Hard limit for one executor invocation.
    pub process_timeout_secs: u64,
    pub env: BTreeMap<String, String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["-m".to_string(), "pytest".to_string()],
            flavor: ExecutorFlavor::Pytest,
            reruns: 0,
            test_timeout_secs: None,
            parallel: 0,
            process_timeout_secs: default_process_timeout_secs(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Generate-execute cycles, the initial generation included.
    pub max_attempts: u32,
    /// Once exceeded, no further attempt is started.
    pub wall_clock_budget_secs: Option<u64>,
    pub log_tail_chars: usize,
    /// File whose text replaces the built-in system instruction for the
    /// first generation.
    pub system_guide: Option<PathBuf>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            wall_clock_budget_secs: None,
            log_tail_chars: DEFAULT_LOG_TAIL_CHARS,
            system_guide: None,
        }
    }
}

fn default_process_timeout_secs() -> u64 {
    600
}

impl Config {
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("testloom"))
    }

    /// Default config file location (`~/.config/testloom/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&content)
            .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, String> {
        toml::from_str::<Config>(content).map_err(|e| e.to_string())
    }

    /// Load the default config file, falling back to defaults when it is
    /// missing or unreadable.
    pub fn load_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring unreadable config; using defaults");
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        match &self.backend {
            BackendConfig::Replay { fixtures } if fixtures.is_empty() => {
                return Err(Error::Configuration(
                    "replay backend needs at least one fixture path".to_string(),
                ));
            }
            BackendConfig::Process { command, .. } if command.is_empty() => {
                return Err(Error::Configuration(
                    "process backend needs a command".to_string(),
                ));
            }
            BackendConfig::Http(http) => {
                if http.endpoint.trim().is_empty() {
                    return Err(Error::Configuration(
                        "http backend needs an endpoint".to_string(),
                    ));
                }
                url::Url::parse(&http.endpoint).map_err(|e| {
                    Error::Configuration(format!("invalid endpoint `{}`: {}", http.endpoint, e))
                })?;
                if !http.timeout_secs.is_finite()
                    || http.timeout_secs <= 0.0
                    || http.timeout_secs > MAX_HTTP_TIMEOUT_SECS
                {
                    return Err(Error::Configuration(format!(
                        "http timeout must be between 0 and {} seconds, got {}",
                        MAX_HTTP_TIMEOUT_SECS, http.timeout_secs
                    )));
                }
            }
            _ => {}
        }

        if self.repair.max_attempts == 0 {
            return Err(Error::Configuration(
                "repair.max_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(entry) = &self.workspace.entry_point {
            if entry.is_absolute() {
                return Err(Error::Configuration(format!(
                    "entry point must be relative to the workspace: {}",
                    entry.display()
                )));
            }
        }
        if self.execution.program.trim().is_empty() {
            return Err(Error::Configuration(
                "execution.program must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.repair.max_attempts, 3);
        assert_eq!(config.repair.log_tail_chars, 4_000);
        assert_eq!(config.execution.flavor, ExecutorFlavor::Pytest);
        assert_eq!(
            config.workspace.artifacts_root(),
            PathBuf::from("./artifacts")
        );
    }

    #[test]
    fn test_parses_http_backend_table() {
        let config = Config::from_toml(
            r#"
            [backend]
            kind = "http"
            endpoint = "http://localhost:8000/v1/chat/completions"
            model = "qwen2.5"
            schema = "openai"
            headers = { "X-Team" = "qa" }

            [repair]
            max_attempts = 2
            "#,
        )
        .unwrap();
        match &config.backend {
            BackendConfig::Http(http) => {
                assert_eq!(http.schema, RequestSchema::Chat);
                assert_eq!(http.model.as_deref(), Some("qwen2.5"));
                assert_eq!(http.api_key_env, DEFAULT_API_KEY_ENV);
                assert_eq!(http.timeout(), Duration::from_secs(60));
                assert_eq!(http.headers.get("X-Team").map(String::as_str), Some("qa"));
            }
            other => panic!("unexpected backend: {other:?}"),
        }
        assert_eq!(config.repair.max_attempts, 2);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_incomplete_backends() {
        let replay = Config::default();
        assert!(matches!(replay.validate(), Err(Error::Configuration(_))));

        let process = Config::from_toml("[backend]\nkind = \"process\"\n").unwrap();
        assert!(matches!(process.validate(), Err(Error::Configuration(_))));

        let http = Config::from_toml("[backend]\nkind = \"http\"\nendpoint = \"not a url\"\n")
            .unwrap();
        assert!(matches!(http.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_zero_attempts_and_absolute_entry() {
        let mut config = Config::from_toml(
            "[backend]\nkind = \"replay\"\nfixtures = [\"a.txt\"]\n[repair]\nmax_attempts = 0\n",
        )
        .unwrap();
        assert!(config.validate().is_err());
        config.repair.max_attempts = 1;
        config.workspace.entry_point = Some(PathBuf::from("/abs/test.py"));
        assert!(config.validate().is_err());
        config.workspace.entry_point = Some(PathBuf::from("tests/test_x.py"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unbounded_http_timeouts() {
        for raw in ["inf", "nan", "1e30", "-1.0"] {
            let config = Config::from_toml(&format!(
                "[backend]\nkind = \"http\"\nendpoint = \"http://localhost:8000/v1\"\ntimeout_secs = {raw}\n"
            ))
            .unwrap();
            assert!(
                matches!(config.validate(), Err(Error::Configuration(_))),
                "timeout_secs = {raw} should be rejected"
            );
            if let BackendConfig::Http(http) = &config.backend {
                assert!(http.timeout() <= Duration::from_secs_f64(MAX_HTTP_TIMEOUT_SECS));
            }
        }
    }

    #[test]
    fn test_repair_table_accepts_system_guide() {
        let config = Config::from_toml(
            "[backend]\nkind = \"replay\"\nfixtures = [\"a.txt\"]\n[repair]\nsystem_guide = \"guides/api.txt\"\n",
        )
        .unwrap();
        assert_eq!(
            config.repair.system_guide,
            Some(PathBuf::from("guides/api.txt"))
        );
        assert_eq!(config.repair.max_attempts, 3);
    }

    #[test]
    fn test_explicit_api_key_wins_over_env() {
        let http = HttpBackendConfig {
            api_key: Some("sk-explicit".to_string()),
            api_key_env: "TESTLOOM_TEST_KEY_THAT_IS_NOT_SET".to_string(),
            ..HttpBackendConfig::default()
        };
        assert_eq!(http.resolve_api_key().as_deref(), Some("sk-explicit"));

        let no_key = HttpBackendConfig {
            api_key_env: "TESTLOOM_TEST_KEY_THAT_IS_NOT_SET".to_string(),
            ..HttpBackendConfig::default()
        };
        assert!(no_key.resolve_api_key().is_none());
    }
}
