//! Container runtime abstraction.
//!
//! The [`ContainerRuntime`] trait is the only seam between session
//! lifecycle logic and the container engine. The lifecycle manager and the
//! reconciler share one instance so retry behaviour applies uniformly.

pub mod docker;
pub mod retry;

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde::Serialize;

use crate::Result;

/// Label marking containers this system owns.
pub const LABEL_MANAGED: &str = "agent-fleet.managed";
/// Label carrying the owning session id.
pub const LABEL_SESSION: &str = "agent-fleet.session";
/// Workspace mount point inside session containers.
pub const CONTAINER_WORKSPACE: &str = "/workspace";
/// Session data mount point inside session containers.
pub const CONTAINER_DATA: &str = "/fleet";

/// Observed container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// Container exists and is running.
    Running,
    /// Container exists but is not running.
    Stopped,
    /// Engine has no such container.
    NotFound,
}

/// Everything needed to create a session container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Canonical container name; creating it twice yields the same container.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Owning session.
    pub session_id: String,
    /// Host path mounted at [`CONTAINER_WORKSPACE`].
    pub workspace_path: PathBuf,
    /// Host path mounted at [`CONTAINER_DATA`].
    pub data_path: PathBuf,
    /// `KEY=value` entries.
    pub env: Vec<String>,
}

/// A container carrying [`LABEL_MANAGED`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedContainer {
    /// Engine id.
    pub id: String,
    /// Name without the leading slash.
    pub name: String,
    /// Value of [`LABEL_SESSION`], if present.
    pub session_id: Option<String>,
    /// Current state.
    pub state: ContainerState,
}

/// Streamed output of an exec or file tail.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Operations the lifecycle manager and reconciler need from an engine.
///
/// Implementations must treat stop on a stopped or missing container and
/// remove on a missing container as success, and must return the existing
/// id when `create` finds the canonical name taken.
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container; returns its id.
    fn create<'a>(&'a self, spec: &'a ContainerSpec) -> BoxFuture<'a, Result<String>>;

    /// Start a created or stopped container.
    fn start<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Stop a container, waiting up to `grace` before it is killed.
    fn stop<'a>(&'a self, id: &'a str, grace: Duration) -> BoxFuture<'a, Result<()>>;

    /// Remove a container.
    fn remove<'a>(&'a self, id: &'a str, force: bool) -> BoxFuture<'a, Result<()>>;

    /// Observe a container's state.
    fn inspect<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<ContainerState>>;

    /// List every container carrying [`LABEL_MANAGED`], running or not.
    fn list_managed(&self) -> BoxFuture<'_, Result<Vec<ManagedContainer>>>;

    /// Run `cmd` inside the container and stream its combined output.
    fn exec<'a>(&'a self, id: &'a str, cmd: &'a [String]) -> BoxFuture<'a, Result<ByteStream>>;

    /// Launch `cmd` in the background, appending its output to `output_path`.
    fn exec_detached_to_file<'a>(
        &'a self,
        id: &'a str,
        cmd: &'a [String],
        output_path: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    /// Follow a file from 1-based line `from_line`.
    fn tail_file<'a>(
        &'a self,
        id: &'a str,
        path: &'a str,
        from_line: u64,
    ) -> BoxFuture<'a, Result<ByteStream>>;

    /// Read a whole file.
    fn read_file<'a>(&'a self, id: &'a str, path: &'a str) -> BoxFuture<'a, Result<Bytes>>;

    /// Find the oldest process whose command line matches `name_match`.
    fn find_process<'a>(
        &'a self,
        id: &'a str,
        name_match: &'a str,
    ) -> BoxFuture<'a, Result<Option<u32>>>;
}

/// Quote `arg` for `sh -c`.
#[must_use]
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '=' | ':'))
    {
        return arg.to_owned();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Join `cmd` into one `sh -c` command line.
#[must_use]
pub fn shell_join(cmd: &[String]) -> String {
    cmd.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}
