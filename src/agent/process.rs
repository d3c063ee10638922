//! Agent CLI process construction.
//!
//! Each query spawns the agent CLI in print mode with streaming JSON output:
//! - `env_clear()` plus an allowlist, so runner-only variables never reach
//!   the agent.
//! - `kill_on_drop(true)`, so a dropped query never leaves an orphan.
//! - stdout/stderr piped; stdin closed.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;

use crate::{AppError, Result};

/// Environment variables inherited by the agent process.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "TERM",
    "TMPDIR",
    "RUST_LOG",
    "ANTHROPIC_API_KEY",
    "ANTHROPIC_BASE_URL",
    "CLAUDE_CODE_OAUTH_TOKEN",
    "GIT_AUTHOR_NAME",
    "GIT_AUTHOR_EMAIL",
    "GIT_COMMITTER_NAME",
    "GIT_COMMITTER_EMAIL",
    "GH_TOKEN",
    "GITHUB_TOKEN",
];

/// Agent executable and the arguments passed on every query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    /// Executable name or path.
    pub program: String,
    /// Leading arguments, placed before the generated ones.
    pub base_args: Vec<String>,
    /// Directory used when a query does not name one.
    pub default_cwd: PathBuf,
}

/// Parameters of one `start` query.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    /// User prompt; must not be blank.
    pub prompt: String,
    /// Agent conversation id to continue. When absent the runner resumes
    /// the conversation recorded in its log, if any.
    #[serde(default)]
    pub resume: Option<String>,
    /// Text appended to the agent's system prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Model override.
    #[serde(default)]
    pub model: Option<String>,
    /// Working directory override.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// MCP server definitions, passed through as `{"mcpServers": …}`.
    #[serde(default)]
    pub mcp_servers: Option<Value>,
}

impl QueryOptions {
    /// Reject malformed parameters before any process is spawned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(AppError::Validation("prompt must not be empty".into()));
        }
        if self
            .model
            .as_deref()
            .is_some_and(|model| model.trim().is_empty())
        {
            return Err(AppError::Validation("model must not be blank".into()));
        }
        if let Some(cwd) = &self.cwd {
            if !cwd.is_dir() {
                return Err(AppError::Validation(format!(
                    "cwd {} is not a directory",
                    cwd.display()
                )));
            }
        }
        if let Some(servers) = &self.mcp_servers {
            if !servers.is_object() {
                return Err(AppError::Validation(
                    "mcpServers must be an object keyed by server name".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Argument vector for one query.
#[must_use]
pub fn build_args(
    command: &AgentCommand,
    options: &QueryOptions,
    resume: Option<&str>,
) -> Vec<String> {
    let mut args = command.base_args.clone();
    args.extend([
        "-p".to_owned(),
        options.prompt.clone(),
        "--output-format".to_owned(),
        "stream-json".to_owned(),
        "--verbose".to_owned(),
        "--include-partial-messages".to_owned(),
    ]);

    if let Some(resume) = resume {
        args.extend(["--resume".to_owned(), resume.to_owned()]);
    }
    if let Some(model) = &options.model {
        args.extend(["--model".to_owned(), model.clone()]);
    }
    if let Some(system_prompt) = &options.system_prompt {
        args.extend(["--append-system-prompt".to_owned(), system_prompt.clone()]);
    }
    if let Some(servers) = &options.mcp_servers {
        let config = serde_json::json!({ "mcpServers": servers });
        args.extend(["--mcp-config".to_owned(), config.to_string()]);
    }
    args
}

/// Build the ready-to-spawn agent command.
#[must_use]
pub fn build_command(
    command: &AgentCommand,
    options: &QueryOptions,
    resume: Option<&str>,
) -> Command {
    let mut cmd = Command::new(&command.program);
    cmd.args(build_args(command, options, resume));

    cmd.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }

    let cwd: &Path = options.cwd.as_deref().unwrap_or(&command.default_cwd);
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}
