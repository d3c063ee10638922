//! Orchestrator configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::runtime::retry::RetryPolicy;
use crate::{AppError, Result};

/// Container engine settings for session containers.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ContainerConfig {
    /// Image used for every session container. Must ship the runner binary.
    pub image: String,
    /// Prefix of the canonical container name; the session id is appended.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Seconds the engine waits after SIGTERM before killing on stop.
    #[serde(default = "default_stop_grace_seconds")]
    pub stop_grace_seconds: u64,
    /// Explicit engine socket (e.g. `unix:///var/run/docker.sock`).
    ///
    /// When absent the engine's local defaults are used.
    #[serde(default)]
    pub docker_host: Option<String>,
    /// Extra `KEY=value` environment entries passed into every container.
    #[serde(default)]
    pub env: Vec<String>,
}

/// How the orchestrator launches and probes the in-container runner.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RunnerConfig {
    /// Runner executable inside the container.
    #[serde(default = "default_runner_command")]
    pub command: String,
    /// Pattern passed to the process probe to find a live runner.
    #[serde(default = "default_runner_command")]
    pub process_name: String,
    /// Agent CLI the runner drives.
    #[serde(default = "default_agent_command")]
    pub agent_command: String,
    /// Extra arguments forwarded to the agent CLI on every query.
    #[serde(default)]
    pub agent_args: Vec<String>,
    /// How long to wait for a freshly started runner to answer `health`.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: default_runner_command(),
            process_name: default_runner_command(),
            agent_command: default_agent_command(),
            agent_args: Vec::new(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Reconciliation loop settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ReconcileConfig {
    /// Seconds between periodic reconciliation passes.
    #[serde(default = "default_reconcile_interval")]
    pub interval_seconds: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_reconcile_interval(),
        }
    }
}

/// Bounded backoff for idempotent container engine calls.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Event fan-out settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DispatcherConfig {
    /// Per-subscriber buffer; a subscriber that falls this far behind is dropped.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

fn default_name_prefix() -> String {
    "agent-fleet-".into()
}

fn default_stop_grace_seconds() -> u64 {
    10
}

fn default_runner_command() -> String {
    "agent-fleet-runner".into()
}

fn default_agent_command() -> String {
    "claude".into()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_http_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}

fn default_clone_timeout_seconds() -> u64 {
    600
}

fn default_forge_base_url() -> String {
    "https://github.com".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding one git checkout per session.
    pub workspace_root: PathBuf,
    /// Directory holding one data dir per session (message log, runner socket, runner log).
    pub data_root: PathBuf,
    /// Orchestrator session store. Defaults to `<data_root>/fleet.db`.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// HTTP port for the API.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Interface the API binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Base URL used to expand `owner/name` repository shorthand.
    #[serde(default = "default_forge_base_url")]
    pub forge_base_url: String,
    /// Upper bound on preparing a session checkout.
    #[serde(default = "default_clone_timeout_seconds")]
    pub clone_timeout_seconds: u64,
    /// Container engine settings.
    pub container: ContainerConfig,
    /// Runner launch settings.
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Reconciliation loop settings.
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// Retry settings for container engine calls.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Dispatcher settings.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

impl GlobalConfig {
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

    /// Parse configuration from a TOML string, create the storage roots,
    /// and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Path of the orchestrator's session store.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_root.join("fleet.db"))
    }

    /// Host directory holding the checkout for `session_id`.
    #[must_use]
    pub fn session_workspace_dir(&self, session_id: &str) -> PathBuf {
        self.workspace_root.join(session_id)
    }

    /// Host directory holding the message log and runner socket for `session_id`.
    #[must_use]
    pub fn session_data_dir(&self, session_id: &str) -> PathBuf {
        self.data_root.join(session_id)
    }

    /// Canonical container name for `session_id`.
    #[must_use]
    pub fn container_name(&self, session_id: &str) -> String {
        format!("{}{session_id}", self.container.name_prefix)
    }

    /// Grace period applied when stopping containers.
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.container.stop_grace_seconds)
    }

    /// Time allowed for cloning a session's repository.
    #[must_use]
    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_seconds)
    }

    /// Interval between reconciliation passes.
    #[must_use]
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile.interval_seconds)
    }

    /// Retry policy shared by every idempotent engine call.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.container.image.trim().is_empty() {
            return Err(AppError::Config("container.image must not be empty".into()));
        }

        if self.container.name_prefix.is_empty() {
            return Err(AppError::Config(
                "container.name_prefix must not be empty".into(),
            ));
        }

        if self.clone_timeout_seconds == 0 {
            return Err(AppError::Config(
                "clone_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.reconcile.interval_seconds == 0 {
            return Err(AppError::Config(
                "reconcile.interval_seconds must be greater than zero".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(AppError::Config(
                "retry.max_attempts must be greater than zero".into(),
            ));
        }

        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(AppError::Config(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }

        if self.dispatcher.subscriber_buffer == 0 {
            return Err(AppError::Config(
                "dispatcher.subscriber_buffer must be greater than zero".into(),
            ));
        }

        self.workspace_root = prepare_root("workspace_root", &self.workspace_root)?;
        self.data_root = prepare_root("data_root", &self.data_root)?;

        Ok(())
    }
}

fn prepare_root(field: &str, path: &Path) -> Result<PathBuf> {
    fs::create_dir_all(path)
        .map_err(|err| AppError::Config(format!("{field} cannot be created: {err}")))?;
    path.canonicalize()
        .map_err(|err| AppError::Config(format!("{field} invalid: {err}")))
}
