//! Session lifecycle: create, start, stop, archive.
//!
//! Every operation takes the session's lock, so transitions for one session
//! are serialized while different sessions proceed in parallel. Each step
//! is idempotent (container create resolves an existing name, stop and
//! remove tolerate missing containers, runner launch probes first), so a
//! crash between steps is repaired by the next reconciliation pass.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use super::logs::{LogStore, MESSAGE_DB_FILE};
use super::runners::{RunnerRegistry, RUNNER_SOCKET_FILE};
use super::workspace::{resolve_clone_url, WorkspaceProvider};
use crate::agent::process::QueryOptions;
use crate::config::GlobalConfig;
use crate::events::Dispatcher;
use crate::locks::KeyedLocks;
use crate::models::message::{MessagePage, MessageRange};
use crate::models::session::{Session, SessionStatus};
use crate::persistence::session_repo::SessionRepo;
use crate::runtime::{
    ByteStream, ContainerRuntime, ContainerSpec, ContainerState, CONTAINER_DATA,
    CONTAINER_WORKSPACE,
};
use crate::{AppError, Result};

/// Status message while the container and runner come up.
pub const STARTING_MESSAGE: &str = "Starting container…";
/// Runner output file inside the container.
pub const RUNNER_LOG_PATH: &str = "/fleet/runner.log";

const DEFAULT_BRANCH: &str = "main";
const HEALTH_POLL: Duration = Duration::from_millis(100);

/// Parameters of a new session.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateSession {
    /// Display name; defaults to the repository name.
    #[serde(default)]
    pub name: Option<String>,
    /// Clone URL or `owner/name` shorthand.
    pub repo_url: String,
    /// Branch to check out; defaults to `main`.
    #[serde(default)]
    pub branch: Option<String>,
    /// Prompt sent once the session first reaches `running`.
    #[serde(default)]
    pub initial_prompt: Option<String>,
}

/// A freshly created session and its background provisioning task.
pub struct Provisioning {
    /// The `creating` record as persisted.
    pub session: Session,
    /// Resolves to the record once provisioning settled on `running` or `error`.
    pub task: JoinHandle<Result<Session>>,
}

/// Sole writer of session status and container id.
#[derive(Clone)]
pub struct SessionManager {
    pub(super) config: Arc<GlobalConfig>,
    pub(super) repo: SessionRepo,
    pub(super) runtime: Arc<dyn ContainerRuntime>,
    pub(super) workspaces: Arc<dyn WorkspaceProvider>,
    pub(super) dispatcher: Dispatcher,
    pub(super) logs: LogStore,
    pub(super) runners: RunnerRegistry,
    pub(super) locks: KeyedLocks,
}

impl SessionManager {
    /// Wire a manager over its collaborators.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        repo: SessionRepo,
        runtime: Arc<dyn ContainerRuntime>,
        workspaces: Arc<dyn WorkspaceProvider>,
        dispatcher: Dispatcher,
    ) -> Self {
        let logs = LogStore::new(&config.data_root);
        let runners = RunnerRegistry::new(dispatcher.clone(), logs.clone(), &config.data_root);
        Self {
            config,
            repo,
            runtime,
            workspaces,
            dispatcher,
            logs,
            runners,
            locks: KeyedLocks::new(),
        }
    }

    /// Orchestrator dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Read access to runner message logs.
    #[must_use]
    pub fn logs(&self) -> &LogStore {
        &self.logs
    }

    /// Attached runners.
    #[must_use]
    pub fn runners(&self) -> &RunnerRegistry {
        &self.runners
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    /// Persist a `creating` session and provision it in the background.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for a malformed request or
    /// `AppError::Db` if the record cannot be stored.
    pub async fn create_session(&self, request: CreateSession) -> Result<Provisioning> {
        resolve_clone_url(&self.config.forge_base_url, &request.repo_url)?;
        let branch = match request.branch.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_BRANCH.to_owned(),
            Some(branch) if branch.starts_with('-') || branch.contains(char::is_whitespace) => {
                return Err(AppError::Validation(format!("invalid branch '{branch}'")));
            }
            Some(branch) => branch.to_owned(),
        };
        let name = match request.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => default_name(&request.repo_url),
        };
        let initial_prompt = request
            .initial_prompt
            .filter(|prompt| !prompt.trim().is_empty());

        let mut session = Session::new(
            name,
            request.repo_url.trim().to_owned(),
            branch,
            initial_prompt,
        );
        session.workspace_path = self
            .config
            .session_workspace_dir(&session.id)
            .display()
            .to_string();

        let guard = self.locks.lock(&session.id).await;
        let session = self.repo.create(&session).await?;
        self.dispatcher.publish_session(&session);
        info!(
            session_id = %session.id,
            repo = %session.repo_url,
            branch = %session.branch,
            "session created"
        );

        let manager = self.clone();
        let session_id = session.id.clone();
        let span = info_span!("provision", session_id = %session_id);
        let task = tokio::spawn(
            async move { manager.provision(&session_id, guard).await }.instrument(span),
        );
        Ok(Provisioning { session, task })
    }

    /// Fetch one session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id.
    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.repo.get_by_id(session_id).await
    }

    /// Every session, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store cannot be read.
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.repo.list().await
    }

    /// Bring a `stopped` or `error` session back to `running`.
    ///
    /// A `running` session is returned unchanged without touching its
    /// container.
    ///
    /// # Errors
    ///
    /// - `AppError::Conflict` for `creating` or `archived` sessions.
    /// - The failing step's error otherwise; the session is then `error`.
    pub async fn start_session(&self, session_id: &str) -> Result<Session> {
        let _guard = self.locks.lock(session_id).await;
        let session = self.repo.get_by_id(session_id).await?;
        match session.status {
            SessionStatus::Running => return Ok(session),
            SessionStatus::Creating => {
                return Err(AppError::Conflict(format!(
                    "session {session_id} is still being created"
                )));
            }
            SessionStatus::Archived => {
                return Err(AppError::Conflict(format!("session {session_id} is archived")));
            }
            SessionStatus::Stopped | SessionStatus::Error => {}
        }

        async {
            match self.launch(session).await {
                Ok(session) => Ok(session),
                Err(err) => {
                    self.fail_session(session_id, &err).await?;
                    Err(err)
                }
            }
        }
        .instrument(info_span!("start_session", session_id))
        .await
    }

    /// Stop (not remove) the session's container.
    ///
    /// A `stopped` session is returned unchanged.
    ///
    /// # Errors
    ///
    /// - `AppError::Conflict` for `creating` or `archived` sessions.
    /// - `AppError::Runtime` if the container cannot be stopped.
    pub async fn stop_session(&self, session_id: &str) -> Result<Session> {
        let _guard = self.locks.lock(session_id).await;
        let session = self.repo.get_by_id(session_id).await?;
        match session.status {
            SessionStatus::Stopped => return Ok(session),
            SessionStatus::Creating => {
                return Err(AppError::Conflict(format!(
                    "session {session_id} is still being created"
                )));
            }
            SessionStatus::Archived => {
                return Err(AppError::Conflict(format!("session {session_id} is archived")));
            }
            SessionStatus::Running | SessionStatus::Error => {}
        }

        let span = info_span!("stop_session", session_id);
        async {
            self.runners.detach(session_id);
            if let Some(container_id) = &session.container_id {
                if let Err(err) = self.runtime.stop(container_id, self.config.stop_grace()).await {
                    self.fail_session(session_id, &err).await?;
                    return Err(err);
                }
            }

            let stopped = self
                .repo
                .transition_if(
                    session_id,
                    session.status,
                    session.container_id.as_deref(),
                    SessionStatus::Stopped,
                    None,
                )
                .await?
                .ok_or_else(|| changed_concurrently(session_id))?;
            self.dispatcher.publish_session(&stopped);
            info!("session stopped");
            Ok(stopped)
        }
        .instrument(span)
        .await
    }

    /// Archive a session: stop and remove its container, release its
    /// workspace, keep its message history. Archiving twice is a no-op.
    ///
    /// Cleanup failures are logged and do not block the transition.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id or `AppError::Db` if
    /// the record cannot be updated.
    pub async fn archive_session(&self, session_id: &str) -> Result<Session> {
        let _guard = self.locks.lock(session_id).await;
        let session = self.repo.get_by_id(session_id).await?;
        if session.is_archived() {
            return Ok(session);
        }

        let span = info_span!("archive_session", session_id);
        async {
            self.runners.detach(session_id);
            if let Some(container_id) = &session.container_id {
                if let Err(err) = self.runtime.stop(container_id, self.config.stop_grace()).await {
                    warn!(%err, %container_id, "failed to stop container during archive");
                }
                if let Err(err) = self.runtime.remove(container_id, true).await {
                    warn!(%err, %container_id, "failed to remove container during archive");
                }
            }
            if let Err(err) = self
                .workspaces
                .release(Path::new(&session.workspace_path))
                .await
            {
                warn!(%err, "failed to release workspace during archive");
            }
            self.logs.evict(session_id).await;

            let archived = self
                .repo
                .transition_if(
                    session_id,
                    session.status,
                    session.container_id.as_deref(),
                    SessionStatus::Archived,
                    None,
                )
                .await?
                .ok_or_else(|| changed_concurrently(session_id))?;
            self.dispatcher.publish_session(&archived);
            info!("session archived");
            Ok(archived)
        }
        .instrument(span)
        .await
    }

    /// Send a prompt to the session's runner. Returns the runner's
    /// acknowledgement; the query's events arrive through the dispatcher.
    ///
    /// # Errors
    ///
    /// - `AppError::Validation` for a blank prompt.
    /// - `AppError::Conflict` when the session is not `running` or a query
    ///   is already active.
    /// - `AppError::Ipc` when the runner cannot be reached.
    pub async fn send_prompt(&self, session_id: &str, options: QueryOptions) -> Result<Value> {
        if options.prompt.trim().is_empty() {
            return Err(AppError::Validation("prompt must not be empty".into()));
        }
        let session = self.repo.get_by_id(session_id).await?;
        let container_id = running_container(&session)?;

        let client = self.runners.attach(session_id, container_id, None);
        let last_sequence = self.logs.last_sequence(session_id).await;
        // Dropping the stream detaches this caller; the query keeps running.
        drop(client.start(options).await?);
        info!(session_id, last_sequence, "prompt delivered");
        Ok(serde_json::json!({ "started": true, "lastSequence": last_sequence }))
    }

    /// Interrupt the session's active query. `false` when nothing was running.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id or `AppError::Ipc` when
    /// a running session's runner cannot be reached.
    pub async fn interrupt(&self, session_id: &str) -> Result<bool> {
        let session = self.repo.get_by_id(session_id).await?;
        if session.status != SessionStatus::Running {
            return Ok(false);
        }
        self.runners.client_for(session_id).interrupt().await
    }

    /// Slash commands the session's agent advertised.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` when the session is not `running`.
    pub async fn commands(&self, session_id: &str) -> Result<Vec<String>> {
        let session = self.repo.get_by_id(session_id).await?;
        running_container(&session)?;
        self.runners.client_for(session_id).commands().await
    }

    /// Page through a session's persisted messages.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id.
    pub async fn messages(&self, session_id: &str, range: MessageRange) -> Result<MessagePage> {
        self.repo.get_by_id(session_id).await?;
        self.logs.page(session_id, range).await
    }

    /// The runner's output file, from 1-based line `from_line`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` when the session never had a container
    /// or the file does not exist yet.
    pub async fn runner_log(
        &self,
        session_id: &str,
        from_line: u64,
        follow: bool,
    ) -> Result<ByteStream> {
        let session = self.repo.get_by_id(session_id).await?;
        let container_id = session
            .container_id
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} has no container")))?;

        if follow {
            return self
                .runtime
                .tail_file(&container_id, RUNNER_LOG_PATH, from_line)
                .await;
        }
        let contents = self.runtime.read_file(&container_id, RUNNER_LOG_PATH).await?;
        let contents = skip_lines(&contents, from_line);
        Ok(futures_util::stream::once(async move { Ok(contents) }).boxed())
    }

    /// Record `err` on the session as an `error` status.
    ///
    /// Sessions already in `error` only get their message replaced; archived
    /// sessions are left alone.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the record cannot be updated.
    pub async fn fail_session(&self, session_id: &str, err: &AppError) -> Result<Session> {
        let message = err.to_string();
        let session = self.repo.get_by_id(session_id).await?;
        let updated = match session.status {
            SessionStatus::Archived => return Ok(session),
            SessionStatus::Error => {
                self.repo
                    .set_status_message(session_id, Some(&message))
                    .await?
            }
            status => {
                match self
                    .repo
                    .transition_if(
                        session_id,
                        status,
                        session.container_id.as_deref(),
                        SessionStatus::Error,
                        Some(&message),
                    )
                    .await?
                {
                    Some(updated) => updated,
                    None => return self.repo.get_by_id(session_id).await,
                }
            }
        };
        warn!(session_id, error = %message, "session failed");
        self.dispatcher.publish_session(&updated);
        Ok(updated)
    }

    /// Stop every runner relay.
    pub fn shutdown(&self) {
        self.runners.shutdown();
    }

    async fn provision(&self, session_id: &str, _guard: OwnedMutexGuard<()>) -> Result<Session> {
        match self.provision_steps(session_id).await {
            Ok(session) => Ok(session),
            Err(err) => self.fail_session(session_id, &err).await,
        }
    }

    async fn provision_steps(&self, session_id: &str) -> Result<Session> {
        let session = self.repo.get_by_id(session_id).await?;
        let clone_timeout = self.config.clone_timeout();
        tokio::time::timeout(clone_timeout, self.workspaces.prepare(&session))
            .await
            .map_err(|_| {
                AppError::Workspace(format!(
                    "clone of {} timed out after {}s",
                    session.repo_url,
                    clone_timeout.as_secs()
                ))
            })??;
        tokio::fs::create_dir_all(self.config.session_data_dir(session_id)).await?;

        let session = self
            .repo
            .set_status_message(session_id, Some(STARTING_MESSAGE))
            .await?;
        self.dispatcher.publish_session(&session);

        let session = self.launch(session).await?;

        if let Some(prompt) = session.initial_prompt.clone() {
            let options = QueryOptions {
                prompt,
                ..QueryOptions::default()
            };
            if let Err(err) = self.send_prompt(session_id, options).await {
                warn!(%err, "initial prompt not delivered");
            }
        }
        Ok(session)
    }

    /// Ensure container, runner, and `running` status. Caller holds the lock.
    async fn launch(&self, session: Session) -> Result<Session> {
        let container_id = self.ensure_container(&session).await?;
        self.runtime.start(&container_id).await?;
        self.ensure_runner(&session.id, &container_id).await?;

        let running = self
            .repo
            .transition_if(
                &session.id,
                session.status,
                Some(&container_id),
                SessionStatus::Running,
                None,
            )
            .await?
            .ok_or_else(|| changed_concurrently(&session.id))?;
        self.dispatcher.publish_session(&running);
        info!(session_id = %running.id, %container_id, "session running");
        Ok(running)
    }

    /// The session's container, created if it never existed or vanished.
    async fn ensure_container(&self, session: &Session) -> Result<String> {
        if let Some(container_id) = &session.container_id {
            if self.runtime.inspect(container_id).await? != ContainerState::NotFound {
                return Ok(container_id.clone());
            }
            info!(%container_id, "container vanished, recreating");
        }

        let spec = ContainerSpec {
            name: self.config.container_name(&session.id),
            image: self.config.container.image.clone(),
            session_id: session.id.clone(),
            workspace_path: session.workspace_path.clone().into(),
            data_path: self.config.session_data_dir(&session.id),
            env: self.config.container.env.clone(),
        };
        let container_id = self.runtime.create(&spec).await?;
        if session.container_id.as_deref() != Some(container_id.as_str()) {
            self.repo.set_container_id(&session.id, &container_id).await?;
        }
        Ok(container_id)
    }

    /// Attach the session's runner, launching it only when no runner
    /// process is alive in the container.
    pub(super) async fn ensure_runner(&self, session_id: &str, container_id: &str) -> Result<()> {
        let probe = &self.config.runner.process_name;
        let pid = match self.runtime.find_process(container_id, probe).await? {
            Some(pid) => {
                debug!(session_id, pid, "runner already alive");
                Some(pid)
            }
            None => {
                let command = self.runner_command(session_id);
                self.runtime
                    .exec_detached_to_file(container_id, &command, RUNNER_LOG_PATH)
                    .await?;
                self.wait_for_runner(session_id).await;
                self.runtime.find_process(container_id, probe).await.ok().flatten()
            }
        };
        self.runners.attach(session_id, container_id, pid);
        Ok(())
    }

    fn runner_command(&self, session_id: &str) -> Vec<String> {
        let runner = &self.config.runner;
        let mut command = vec![
            runner.command.clone(),
            "--socket".to_owned(),
            format!("{CONTAINER_DATA}/{RUNNER_SOCKET_FILE}"),
            "--db".to_owned(),
            format!("{CONTAINER_DATA}/{MESSAGE_DB_FILE}"),
            "--session-id".to_owned(),
            session_id.to_owned(),
            "--workspace".to_owned(),
            CONTAINER_WORKSPACE.to_owned(),
            "--agent-command".to_owned(),
            runner.agent_command.clone(),
        ];
        for arg in &runner.agent_args {
            command.extend(["--agent-arg".to_owned(), arg.clone()]);
        }
        command
    }

    async fn wait_for_runner(&self, session_id: &str) {
        let client = self.runners.client_for(session_id);
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.runner.connect_timeout_ms);
        loop {
            match client.health().await {
                Ok(()) => return,
                Err(err) if tokio::time::Instant::now() >= deadline => {
                    // Prompts will still reach it once it binds its socket.
                    warn!(session_id, %err, "runner did not answer health in time");
                    return;
                }
                Err(_) => tokio::time::sleep(HEALTH_POLL).await,
            }
        }
    }
}

fn running_container(session: &Session) -> Result<&str> {
    if session.status != SessionStatus::Running {
        return Err(AppError::Conflict(format!(
            "session {} is {}, not running",
            session.id, session.status
        )));
    }
    session
        .container_id
        .as_deref()
        .ok_or_else(|| AppError::Conflict(format!("session {} has no container", session.id)))
}

fn changed_concurrently(session_id: &str) -> AppError {
    AppError::Conflict(format!("session {session_id} changed concurrently"))
}

fn default_name(repo: &str) -> String {
    repo.trim()
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .map(|name| name.trim_end_matches(".git"))
        .filter(|name| !name.is_empty())
        .unwrap_or("session")
        .to_owned()
}

/// Drop the first `from_line - 1` lines.
fn skip_lines(contents: &Bytes, from_line: u64) -> Bytes {
    let mut remaining = from_line.saturating_sub(1);
    let mut offset = 0;
    while remaining > 0 {
        match contents[offset..].iter().position(|&b| b == b'\n') {
            Some(pos) => {
                offset += pos + 1;
                remaining -= 1;
            }
            None => return Bytes::new(),
        }
    }
    contents.slice(offset..)
}
