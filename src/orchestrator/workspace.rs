//! Per-session repository checkouts on the host.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::process::Command;
use tracing::{info, info_span, warn, Instrument};

use crate::models::session::Session;
use crate::{AppError, Result};

/// Prepares and releases the checkout mounted into a session container.
pub trait WorkspaceProvider: Send + Sync {
    /// Make the checkout for `session` available at `session.workspace_path`.
    fn prepare<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, Result<PathBuf>>;

    /// Delete the checkout at `workspace_path`. Missing checkouts are fine.
    fn release<'a>(&'a self, workspace_path: &'a Path) -> BoxFuture<'a, Result<()>>;
}

/// Clones repositories with the `git` CLI.
#[derive(Debug, Clone)]
pub struct GitWorkspaces {
    forge_base_url: String,
}

impl GitWorkspaces {
    /// Workspaces resolving `owner/name` shorthand against `forge_base_url`.
    #[must_use]
    pub fn new(forge_base_url: impl Into<String>) -> Self {
        Self {
            forge_base_url: forge_base_url.into(),
        }
    }

    async fn clone_repo(&self, session: &Session) -> Result<PathBuf> {
        let path = PathBuf::from(&session.workspace_path);
        if path.join(".git").is_dir() {
            info!(path = %path.display(), "reusing existing checkout");
            return Ok(path);
        }
        if path.exists() {
            // A partial clone from an interrupted attempt.
            tokio::fs::remove_dir_all(&path).await?;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let url = resolve_clone_url(&self.forge_base_url, &session.repo_url)?;
        info!(%url, branch = %session.branch, "cloning repository");

        let output = Command::new("git")
            .args(["clone", "--branch", &session.branch, "--single-branch", "--", &url])
            .arg(&path)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| AppError::Workspace(format!("failed to run git: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Workspace(format!(
                "git clone of {url} ({}) failed: {}",
                session.branch,
                stderr.trim()
            )));
        }
        Ok(path)
    }
}

impl WorkspaceProvider for GitWorkspaces {
    fn prepare<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, Result<PathBuf>> {
        let span = info_span!("prepare_workspace", session_id = %session.id);
        self.clone_repo(session).instrument(span).boxed()
    }

    fn release<'a>(&'a self, workspace_path: &'a Path) -> BoxFuture<'a, Result<()>> {
        async move {
            match tokio::fs::remove_dir_all(workspace_path).await {
                Ok(()) => {
                    info!(path = %workspace_path.display(), "workspace released");
                    Ok(())
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => {
                    warn!(path = %workspace_path.display(), %err, "failed to release workspace");
                    Err(AppError::Workspace(format!(
                        "failed to remove {}: {err}",
                        workspace_path.display()
                    )))
                }
            }
        }
        .boxed()
    }
}

/// Expand `owner/name` shorthand into a clone URL; other forms pass through.
///
/// # Errors
///
/// Returns `AppError::Validation` for an empty, option-shaped or malformed
/// reference.
pub fn resolve_clone_url(forge_base_url: &str, repo: &str) -> Result<String> {
    let repo = repo.trim();
    if repo.is_empty() {
        return Err(AppError::Validation("repository must not be empty".into()));
    }
    if repo.starts_with('-') {
        return Err(AppError::Validation(format!(
            "repository '{repo}' must not start with '-'"
        )));
    }
    if repo.contains("://") || repo.starts_with("git@") || repo.starts_with('/') {
        return Ok(repo.to_owned());
    }

    let mut parts = repo.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None)
            if is_slug(owner) && is_slug(name.trim_end_matches(".git")) =>
        {
            let name = name.trim_end_matches(".git");
            Ok(format!(
                "{}/{owner}/{name}.git",
                forge_base_url.trim_end_matches('/')
            ))
        }
        _ => Err(AppError::Validation(format!(
            "repository '{repo}' is neither a URL nor owner/name"
        ))),
    }
}

fn is_slug(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
