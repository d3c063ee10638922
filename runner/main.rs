#![forbid(unsafe_code)]

//! `agent-fleet-runner`: in-container agent runner.
//!
//! Opens the session's message log, then serves the control socket that the
//! orchestrator uses to start, interrupt, and observe agent queries.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use agent_fleet::agent::process::AgentCommand;
use agent_fleet::agent::AgentRunner;
use agent_fleet::bootstrap::{init_tracing, shutdown_signal, LogFormat};
use agent_fleet::events::Dispatcher;
use agent_fleet::ipc::{spawn_control_server, ControlState};
use agent_fleet::persistence::db::{self, Store};
use agent_fleet::persistence::message_log::MessageLog;
use agent_fleet::{AppError, Result};

/// How long an interrupted query may take to wind down on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "agent-fleet-runner", about = "In-container agent runner", version, long_about = None)]
struct Cli {
    /// Control socket path.
    #[arg(long)]
    socket: PathBuf,

    /// Message log database path.
    #[arg(long)]
    db: PathBuf,

    /// Session served by this runner.
    #[arg(long)]
    session_id: String,

    /// Default working directory of agent queries.
    #[arg(long, default_value = "/workspace")]
    workspace: PathBuf,

    /// Agent CLI executable.
    #[arg(long, default_value = "claude")]
    agent_command: String,

    /// Extra argument passed to the agent on every query (repeatable).
    #[arg(long = "agent-arg", allow_hyphen_values = true)]
    agent_args: Vec<String>,

    /// Events buffered per subscriber before it is dropped.
    #[arg(long, default_value_t = 256)]
    subscriber_buffer: usize,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!(session_id = %args.session_id, "agent-fleet-runner bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let pool = Arc::new(db::connect(&args.db, Store::Messages).await?);
    let log = MessageLog::new(Arc::clone(&pool));
    let last_sequence = log.last_sequence(&args.session_id).await?;
    info!(db = %args.db.display(), last_sequence, "message log opened");

    let dispatcher = Dispatcher::new(args.subscriber_buffer);
    let runner = AgentRunner::new(
        args.session_id.clone(),
        log.clone(),
        dispatcher.clone(),
        AgentCommand {
            program: args.agent_command,
            base_args: args.agent_args,
            default_cwd: args.workspace,
        },
    );

    let ct = CancellationToken::new();
    let state = Arc::new(ControlState {
        session_id: args.session_id,
        runner: runner.clone(),
        log,
        dispatcher,
    });
    let server = spawn_control_server(&args.socket, state, ct.clone())?;
    info!("agent-fleet-runner ready");

    shutdown_signal().await;
    info!("shutdown signal received");

    if runner.interrupt()
        && tokio::time::timeout(SHUTDOWN_GRACE, runner.wait_idle())
            .await
            .is_err()
    {
        warn!("agent did not stop in time");
    }
    ct.cancel();
    let _ = server.await;

    match std::fs::remove_file(&args.socket) {
        Ok(()) => {}
        // The listener may already have unlinked it.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(%err, "failed to remove control socket"),
    }
    pool.close().await;
    info!("agent-fleet-runner shut down");
    Ok(())
}
