//! Bridge configuration parsing and validation.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::info;

use crate::{AppError, Result};

/// Environment variable that overrides the configured worker interpreter.
pub const INTERPRETER_ENV: &str = "WORKER_BRIDGE_INTERPRETER";

/// How filesystem paths must be rewritten before they reach the worker.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PathStyle {
    /// Worker shares the caller's filesystem namespace.
    #[default]
    Native,
    /// Worker runs under WSL: `C:\dir` becomes `/mnt/c/dir`.
    Wsl,
}

/// Worker process launch settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkerConfig {
    /// Interpreter binary used to run the worker script.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Arguments placed before the script (e.g. a launcher's own flags).
    #[serde(default)]
    pub interpreter_args: Vec<String>,
    /// Worker script passed to the interpreter; omitted when `None`.
    #[serde(default)]
    pub script: Option<PathBuf>,
    /// Arguments placed after the script.
    #[serde(default)]
    pub args: Vec<String>,
    /// Filesystem namespace the interpreter runs under.
    #[serde(default)]
    pub path_style: PathStyle,
    /// Configuration bundle location sent with every `initialize`.
    #[serde(default = "default_bundle_path")]
    pub bundle_path: PathBuf,
    /// Worker log level, forwarded as `AMPLIFIER_LOG_LEVEL`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Worker log file, forwarded as `AMPLIFIER_BRIDGE_LOG`.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Directory the worker process starts in.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

/// Per-operation deadlines.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Initialize deadline; sized for first-run dependency downloads.
    #[serde(default = "default_initialize_seconds")]
    pub initialize_seconds: u64,
    /// Execute deadline for a single turn.
    #[serde(default = "default_execute_seconds")]
    pub execute_seconds: u64,
    /// Wait after the `shutdown` command before terminating the worker.
    #[serde(default = "default_shutdown_grace_millis")]
    pub shutdown_grace_millis: u64,
    /// Deadline for the interpreter availability probe.
    #[serde(default = "default_probe_seconds")]
    pub probe_seconds: u64,
}

/// Output sanitizer settings.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SanitizerConfig {
    /// Banner regexes applied in addition to the built-in list.
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

fn default_interpreter() -> String {
    if cfg!(windows) {
        "python".into()
    } else {
        "python3".into()
    }
}

fn default_bundle_path() -> PathBuf {
    PathBuf::from("bundle.yaml")
}

fn default_log_level() -> String {
    "WARNING".into()
}

fn default_initialize_seconds() -> u64 {
    300
}

fn default_execute_seconds() -> u64 {
    600
}

fn default_shutdown_grace_millis() -> u64 {
    500
}

fn default_probe_seconds() -> u64 {
    10
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            interpreter_args: Vec::new(),
            script: None,
            args: Vec::new(),
            path_style: PathStyle::default(),
            bundle_path: default_bundle_path(),
            log_level: default_log_level(),
            log_file: None,
            working_dir: None,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            initialize_seconds: default_initialize_seconds(),
            execute_seconds: default_execute_seconds(),
            shutdown_grace_millis: default_shutdown_grace_millis(),
            probe_seconds: default_probe_seconds(),
        }
    }
}

impl TimeoutConfig {
    /// Initialize deadline as a [`Duration`].
    #[must_use]
    pub fn initialize(&self) -> Duration {
        Duration::from_secs(self.initialize_seconds)
    }

    /// Execute deadline as a [`Duration`].
    #[must_use]
    pub fn execute(&self) -> Duration {
        Duration::from_secs(self.execute_seconds)
    }

    /// Shutdown grace period as a [`Duration`].
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_millis)
    }

    /// Probe deadline as a [`Duration`].
    #[must_use]
    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_seconds)
    }
}

/// Top-level configuration parsed from `bridge.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BridgeConfig {
    /// Worker launch settings.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Operation deadlines.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Output sanitizer settings.
    #[serde(default)]
    pub sanitizer: SanitizerConfig,
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply process environment overrides on top of the file values.
    ///
    /// Only [`INTERPRETER_ENV`] is honoured; an empty value is ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(interpreter) = env::var(INTERPRETER_ENV) {
            if !interpreter.trim().is_empty() {
                info!(%interpreter, "worker interpreter overridden from environment");
                self.worker.interpreter = interpreter;
            }
        }
    }

    /// Check invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        if self.worker.interpreter.trim().is_empty() {
            return Err(AppError::Config("worker.interpreter must not be empty".into()));
        }

        if self.timeouts.initialize_seconds == 0 || self.timeouts.execute_seconds == 0 {
            return Err(AppError::Config(
                "timeouts must be greater than zero".into(),
            ));
        }

        for pattern in &self.sanitizer.extra_patterns {
            Regex::new(pattern).map_err(|err| {
                AppError::Config(format!("invalid sanitizer pattern `{pattern}`: {err}"))
            })?;
        }

        Ok(())
    }
}
