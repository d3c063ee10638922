//! Single-flight agent runner.
//!
//! One [`AgentRunner`] owns one session. At most one query runs at a time;
//! a second `start` while one is active fails with `AppError::Conflict`.
//! Each output line is either folded into a coalesced partial preview or
//! appended to the message log and published as a complete message. When
//! the process exits exactly one terminal event (`done` or `error`) is
//! published and the runner returns to idle.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::parser::{advertised_commands, conversation_id, parse_line, PartialPreview};
use super::process::{build_command, AgentCommand, QueryOptions};
use crate::events::{Dispatcher, Subscription};
use crate::models::event::{PartialMessage, StreamEvent};
use crate::models::message::{AgentMessage, MessageKind};
use crate::persistence::message_log::MessageLog;
use crate::{AppError, Result};

/// How long an interrupted agent may keep running before it is killed.
const INTERRUPT_GRACE: Duration = Duration::from_secs(10);

/// Longest single stdout line accepted from the agent.
pub const MAX_STDOUT_LINE: usize = 8 * 1_048_576;

/// Snapshot returned by the `status` control command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerStatus {
    /// Whether a query is active.
    pub running: bool,
    /// Highest persisted sequence.
    pub last_sequence: i64,
    /// Slash commands last advertised by the agent.
    pub supported_commands: Vec<String>,
}

enum RunState {
    Idle,
    Running {
        pid: Option<u32>,
        interrupt: CancellationToken,
        interrupted: bool,
    },
}

struct Inner {
    session_id: String,
    log: MessageLog,
    dispatcher: Dispatcher,
    command: AgentCommand,
    state: Mutex<RunState>,
    running: watch::Sender<bool>,
    commands: RwLock<Vec<String>>,
    conversation: RwLock<Option<String>>,
}

/// Drives the agent CLI for one session. Cheap to clone.
#[derive(Clone)]
pub struct AgentRunner {
    inner: Arc<Inner>,
}

impl AgentRunner {
    /// Create an idle runner for `session_id`.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        log: MessageLog,
        dispatcher: Dispatcher,
        command: AgentCommand,
    ) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                session_id: session_id.into(),
                log,
                dispatcher,
                command,
                state: Mutex::new(RunState::Idle),
                running,
                commands: RwLock::new(Vec::new()),
                conversation: RwLock::new(None),
            }),
        }
    }

    /// Session this runner serves.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Begin a query. Returns once the agent process has been spawned.
    ///
    /// The returned subscription is registered before the process starts and
    /// sees every event of this query, ending with its terminal event.
    ///
    /// # Errors
    ///
    /// - `AppError::Validation` for malformed options.
    /// - `AppError::Conflict` when a query is already running.
    /// - `AppError::Agent` when the process cannot be spawned.
    pub async fn start(&self, options: QueryOptions) -> Result<Subscription> {
        options.validate()?;

        let interrupt = CancellationToken::new();
        let subscription = {
            let mut state = self.lock_state();
            if matches!(*state, RunState::Running { .. }) {
                return Err(AppError::Conflict(format!(
                    "a query is already running for session {}",
                    self.inner.session_id
                )));
            }
            *state = RunState::Running {
                pid: None,
                interrupt: interrupt.clone(),
                interrupted: false,
            };
            self.inner.dispatcher.subscribe_live(&self.inner.session_id)
        };
        self.inner.running.send_replace(true);

        match self.launch(&options, interrupt).await {
            Ok(()) => Ok(subscription),
            Err(err) => {
                *self.lock_state() = RunState::Idle;
                self.inner.running.send_replace(false);
                Err(err)
            }
        }
    }

    /// Signal the active query to stop.
    ///
    /// Returns `false` when idle. Does not wait for the process to exit; the
    /// terminal `done` event reports completion.
    #[must_use]
    pub fn interrupt(&self) -> bool {
        let mut state = self.lock_state();
        match &mut *state {
            RunState::Running {
                interrupt,
                interrupted,
                pid,
            } => {
                info!(session_id = %self.inner.session_id, ?pid, "interrupting agent");
                *interrupted = true;
                interrupt.cancel();
                true
            }
            RunState::Idle => false,
        }
    }

    /// Whether a query is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.lock_state(), RunState::Running { .. })
    }

    /// Process id of the active agent, if any.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        match *self.lock_state() {
            RunState::Running { pid, .. } => pid,
            RunState::Idle => None,
        }
    }

    /// Wait until no query is active.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.running.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|running| !*running).await;
    }

    /// Slash commands last advertised by the agent.
    #[must_use]
    pub fn supported_commands(&self) -> Vec<String> {
        self.inner
            .commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current runner status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the log cannot be read.
    pub async fn status(&self) -> Result<RunnerStatus> {
        Ok(RunnerStatus {
            running: self.is_running(),
            last_sequence: self.inner.log.last_sequence(&self.inner.session_id).await?,
            supported_commands: self.supported_commands(),
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn launch(&self, options: &QueryOptions, interrupt: CancellationToken) -> Result<()> {
        let session_id = self.inner.session_id.clone();
        let resume = match &options.resume {
            Some(resume) => Some(resume.clone()),
            None => self.recorded_conversation().await?,
        };
        let last = self.inner.log.last_sequence(&session_id).await?;

        let mut child = build_command(&self.inner.command, options, resume.as_deref())
            .spawn()
            .map_err(|err| AppError::Agent(format!("failed to spawn agent: {err}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Agent("failed to capture agent stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Agent("failed to capture agent stderr".into()))?;

        let pid = child.id();
        if let RunState::Running { pid: slot, .. } = &mut *self.lock_state() {
            *slot = pid;
        }
        info!(
            %session_id,
            ?pid,
            ?resume,
            last_sequence = last,
            "agent query started"
        );

        let span = info_span!("agent_query", session_id = %session_id, ?pid);
        let runner = self.clone();
        tokio::spawn(
            async move {
                runner.drive(child, stdout, stderr, interrupt, last).await;
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Conversation id to resume when the caller did not name one.
    async fn recorded_conversation(&self) -> Result<Option<String>> {
        if let Some(id) = self
            .inner
            .conversation
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Ok(Some(id));
        }

        for kind in [MessageKind::Result, MessageKind::Assistant] {
            if let Some(message) = self
                .inner
                .log
                .latest_of_kind(&self.inner.session_id, kind)
                .await?
            {
                if let Some(id) = conversation_id(&message.content) {
                    return Ok(Some(id.to_owned()));
                }
            }
        }
        Ok(None)
    }

    async fn drive(
        self,
        mut child: Child,
        stdout: ChildStdout,
        stderr: ChildStderr,
        interrupt: CancellationToken,
        mut last: i64,
    ) {
        let stderr_tail = tokio::spawn(last_stderr_line(stderr));
        let mut framed =
            FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_STDOUT_LINE));
        let mut preview = PartialPreview::default();
        let mut failure: Option<String> = None;
        let mut kill_at: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;

                () = interrupt.cancelled(), if kill_at.is_none() => {
                    send_interrupt(&mut child);
                    kill_at = Some(Instant::now() + INTERRUPT_GRACE);
                }

                () = sleep_until_opt(kill_at) => {
                    warn!("agent ignored interrupt, killing");
                    if let Err(err) = child.start_kill() {
                        warn!(%err, "failed to kill agent");
                    }
                    kill_at = None;
                }

                item = framed.next() => match item {
                    None => break,
                    Some(Err(err)) => {
                        warn!(%err, "agent stdout unreadable");
                        failure = Some(stdout_failure(&self.inner.session_id, &err));
                        let _ = child.start_kill();
                        break;
                    }
                    Some(Ok(line)) => {
                        if let Err(err) = self.handle_line(&line, &mut preview, &mut last).await {
                            warn!(%err, "failed to record agent output");
                            failure = Some(err.to_string());
                            let _ = child.start_kill();
                            break;
                        }
                    }
                },
            }
        }

        // Closed so writers still blocked on stdout see EPIPE and exit.
        drop(framed);
        let status = child.wait().await;
        let stderr_line = stderr_tail.await.ok().flatten();

        let mut state = self.lock_state();
        let interrupted = matches!(*state, RunState::Running { interrupted: true, .. });
        let event = match (failure, status) {
            (Some(failure), _) => StreamEvent::error(failure),
            (None, _) if interrupted => StreamEvent::done(true),
            (None, Ok(status)) if status.success() => StreamEvent::done(false),
            (None, Ok(status)) => StreamEvent::error(match stderr_line {
                Some(line) => format!("agent exited with {status}: {line}"),
                None => format!("agent exited with {status}"),
            }),
            (None, Err(err)) => StreamEvent::error(format!("failed to wait for agent: {err}")),
        };
        info!(last_sequence = last, interrupted, ?event, "agent query finished");

        *state = RunState::Idle;
        // Published under the state lock so a follow-up start cannot overtake it.
        self.inner.dispatcher.publish(&self.inner.session_id, &event);
        drop(state);
        self.inner.running.send_replace(false);
    }

    async fn handle_line(
        &self,
        line: &str,
        preview: &mut PartialPreview,
        last: &mut i64,
    ) -> Result<()> {
        let Some(message) = parse_line(line) else {
            return Ok(());
        };
        let session_id = &self.inner.session_id;

        let kind = match &message {
            AgentMessage::Partial(event) => {
                if let Some(content) = preview.apply(event) {
                    let partial = PartialMessage {
                        sequence: *last + 1,
                        content,
                    };
                    self.inner
                        .dispatcher
                        .publish(session_id, &StreamEvent::Partial { partial });
                }
                return Ok(());
            }
            AgentMessage::Raw(text) => {
                debug!(raw = %text, "skipping unrecognised agent output");
                return Ok(());
            }
            AgentMessage::System(value) => {
                if let Some(id) = conversation_id(value) {
                    *self
                        .inner
                        .conversation
                        .write()
                        .unwrap_or_else(PoisonError::into_inner) = Some(id.to_owned());
                }
                if let Some(commands) = advertised_commands(value) {
                    debug!(count = commands.len(), "agent advertised commands");
                    *self
                        .inner
                        .commands
                        .write()
                        .unwrap_or_else(PoisonError::into_inner) = commands;
                    // The init banner is capability metadata, not conversation.
                    return Ok(());
                }
                MessageKind::System
            }
            AgentMessage::Assistant(_) => {
                preview.reset();
                MessageKind::Assistant
            }
            AgentMessage::User(_) => MessageKind::User,
            AgentMessage::Result(_) => MessageKind::Result,
        };

        let stored = self
            .inner
            .log
            .append(session_id, kind, message.into_content())
            .await?;
        *last = stored.sequence;
        self.inner
            .dispatcher
            .publish(session_id, &StreamEvent::message(stored));
        Ok(())
    }
}

fn stdout_failure(session_id: &str, err: &LinesCodecError) -> String {
    match err {
        LinesCodecError::MaxLineLengthExceeded => format!(
            "agent output for session {session_id} has a line over {MAX_STDOUT_LINE} bytes"
        ),
        LinesCodecError::Io(err) => {
            format!("failed to read agent output for session {session_id}: {err}")
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn last_stderr_line(stderr: ChildStderr) -> Option<String> {
    let mut lines = BufReader::new(stderr).lines();
    let mut last = None;
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(stderr = %line, "agent stderr");
        if !line.trim().is_empty() {
            last = Some(line);
        }
    }
    last
}

#[cfg(unix)]
fn send_interrupt(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(raw) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGINT) {
        warn!(%err, "SIGINT failed, killing agent");
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn send_interrupt(child: &mut Child) {
    let _ = child.start_kill();
}
