#![forbid(unsafe_code)]

//! `agent-fleet`: fleet orchestrator daemon.
//!
//! Bootstraps configuration, the session store, and the container engine
//! client, reconciles existing sessions, then serves the HTTP API while the
//! reconciler keeps running in the background.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use agent_fleet::api::{self, AppState};
use agent_fleet::bootstrap::{init_tracing, shutdown_signal, LogFormat};
use agent_fleet::config::GlobalConfig;
use agent_fleet::events::Dispatcher;
use agent_fleet::orchestrator::{spawn_reconciler, GitWorkspaces, SessionManager};
use agent_fleet::persistence::db::{self, Store};
use agent_fleet::persistence::session_repo::SessionRepo;
use agent_fleet::runtime::docker::DockerRuntime;
use agent_fleet::{AppError, Result};

/// How long open streams may delay shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "agent-fleet", about = "Container-backed agent session orchestrator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured HTTP port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-fleet bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(port) = args.port {
        config.http_port = port;
    }
    let config = Arc::new(config);
    info!(
        workspace_root = %config.workspace_root.display(),
        data_root = %config.data_root.display(),
        "configuration loaded"
    );

    // ── Initialize store and engine ─────────────────────
    let db = Arc::new(db::connect(config.db_path(), Store::Sessions).await?);
    info!("database connected");

    let runtime =
        DockerRuntime::connect(config.container.docker_host.as_deref(), config.retry_policy())?;
    runtime.ping().await?;
    info!("container engine reachable");

    let manager = SessionManager::new(
        Arc::clone(&config),
        SessionRepo::new(Arc::clone(&db)),
        Arc::new(runtime),
        Arc::new(GitWorkspaces::new(config.forge_base_url.clone())),
        Dispatcher::new(config.dispatcher.subscriber_buffer),
    );

    // ── Startup reconciliation ──────────────────────────
    let report = manager.reconcile_once().await;
    info!(?report, "startup reconciliation complete");

    let ct = CancellationToken::new();
    let reconciler = spawn_reconciler(manager.clone(), config.reconcile_interval(), ct.clone());

    // ── Serve the API ───────────────────────────────────
    let listener = api::bind(&config).await?;
    let api_ct = ct.clone();
    let state = AppState {
        manager: manager.clone(),
    };
    let mut server = tokio::spawn(async move {
        if let Err(err) = api::serve(listener, state, api_ct).await {
            error!(%err, "HTTP API failed");
        }
    });

    info!("agent-fleet ready");

    // ── Wait for shutdown ───────────────────────────────
    let server_exited = tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
            false
        }
        _ = &mut server => {
            warn!("HTTP API exited unexpectedly");
            true
        }
    };
    ct.cancel();
    manager.shutdown();

    if !server_exited && tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await.is_err() {
        warn!("open streams did not close in time");
        server.abort();
    }
    let _ = reconciler.await;
    db.close().await;
    info!("agent-fleet shut down");

    Ok(())
}
