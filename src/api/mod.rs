//! Orchestrator HTTP API.
//!
//! JSON endpoints for session management plus SSE streams. The API trusts
//! its caller; authorization belongs to whatever fronts it.

pub mod error;
mod sessions;
mod stream;

use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::GlobalConfig;
use crate::orchestrator::SessionManager;
use crate::{AppError, Result};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Session lifecycle entry point.
    pub manager: SessionManager,
}

/// Handler for `GET /health`.
async fn health() -> &'static str {
    "ok"
}

/// Build the API router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", get(sessions::list).post(sessions::create))
        .route(
            "/api/sessions/{id}",
            get(sessions::get).delete(sessions::archive),
        )
        .route("/api/sessions/{id}/start", post(sessions::start))
        .route("/api/sessions/{id}/stop", post(sessions::stop))
        .route("/api/sessions/{id}/archive", post(sessions::archive))
        .route("/api/sessions/{id}/prompt", post(sessions::prompt))
        .route("/api/sessions/{id}/interrupt", post(sessions::interrupt))
        .route("/api/sessions/{id}/messages", get(sessions::messages))
        .route("/api/sessions/{id}/commands", get(sessions::commands))
        .route("/api/sessions/{id}/stream", get(stream::session_stream))
        .route("/api/sessions/{id}/runner-log", get(stream::runner_log))
        .route("/api/events", get(stream::session_updates))
        .with_state(state)
}

/// Bind the configured address.
///
/// # Errors
///
/// Returns `AppError::Config` if the address is invalid or cannot be bound.
pub async fn bind(config: &GlobalConfig) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.http_port)
        .parse()
        .map_err(|err| AppError::Config(format!("invalid bind address: {err}")))?;
    TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {addr}: {err}")))
}

/// Serve the API on `listener` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Io` if the server fails.
pub async fn serve(listener: TcpListener, state: AppState, ct: CancellationToken) -> Result<()> {
    let local = listener.local_addr()?;
    info!(%local, "HTTP API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("HTTP server error: {err}")))?;

    info!("HTTP API shut down");
    Ok(())
}
