//! Session CRUD, lifecycle, and prompt handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use super::error::ApiResult;
use super::AppState;
use crate::agent::process::QueryOptions;
use crate::models::message::{MessagePage, MessageRange};
use crate::models::session::Session;
use crate::orchestrator::CreateSession;

/// `GET /api/sessions`
pub(super) async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Session>>> {
    Ok(Json(state.manager.list_sessions().await?))
}

/// `POST /api/sessions` returns the `creating` record; provisioning
/// continues in the background.
pub(super) async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateSession>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let provisioning = state.manager.create_session(request).await?;
    Ok((StatusCode::CREATED, Json(provisioning.session)))
}

/// `GET /api/sessions/{id}`
pub(super) async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.manager.get_session(&id).await?))
}

/// `POST /api/sessions/{id}/start`
pub(super) async fn start(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.manager.start_session(&id).await?))
}

/// `POST /api/sessions/{id}/stop`
pub(super) async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.manager.stop_session(&id).await?))
}

/// `POST /api/sessions/{id}/archive` and `DELETE /api/sessions/{id}`
pub(super) async fn archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.manager.archive_session(&id).await?))
}

/// `POST /api/sessions/{id}/prompt`
pub(super) async fn prompt(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(options): Json<QueryOptions>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let ack = state.manager.send_prompt(&id, options).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

/// `POST /api/sessions/{id}/interrupt`
pub(super) async fn interrupt(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let success = state.manager.interrupt(&id).await?;
    Ok(Json(json!({ "success": success })))
}

/// `GET /api/sessions/{id}/messages?after&before&limit`
pub(super) async fn messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(range): Query<MessageRange>,
) -> ApiResult<Json<MessagePage>> {
    Ok(Json(state.manager.messages(&id, range).await?))
}

/// `GET /api/sessions/{id}/commands`
pub(super) async fn commands(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let commands = state.manager.commands(&id).await?;
    Ok(Json(json!({ "commands": commands })))
}
