//! Server-sent event streams and the runner log.
//!
//! A session stream replays persisted messages after the cursor and then
//! follows the dispatcher live. The cursor comes from `?after=` or, on a
//! browser reconnect, from the `Last-Event-ID` header, which carries the
//! sequence of the last complete message delivered.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::error::ApiResult;
use super::AppState;
use crate::models::event::StreamEvent;

/// `?after=` cursor of a session stream.
#[derive(Debug, Default, Deserialize)]
pub(super) struct StreamQuery {
    after: Option<i64>,
}

/// `?from=&follow=` of the runner log.
#[derive(Debug, Default, Deserialize)]
pub(super) struct LogQuery {
    from: Option<u64>,
    follow: Option<bool>,
}

/// `GET /api/sessions/{id}/stream?after=n`
pub(super) async fn session_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    state.manager.get_session(&id).await?;

    let after = query
        .after
        .or_else(|| last_event_id(&headers))
        .unwrap_or(0)
        .max(0);
    let log = state.manager.logs().get(&id).await?;
    let subscription = state
        .manager
        .dispatcher()
        .subscribe(&id, after, log.as_ref())
        .await?;
    debug!(session_id = %id, after, "stream subscriber connected");

    let events = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.next().await?;
        Some((Ok(sse_event(&event)), subscription))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// `GET /api/events`: session record changes across all sessions.
pub(super) async fn session_updates(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let updates = state.manager.dispatcher().subscribe_updates();
    let events = stream::unfold(updates, |mut updates| async move {
        loop {
            match updates.recv().await {
                Ok(session) => {
                    let event = sse_event(&StreamEvent::Session { session });
                    return Some((Ok(event), updates));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session update subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// `GET /api/sessions/{id}/runner-log?from=n&follow=bool`
pub(super) async fn runner_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Response> {
    let output = state
        .manager
        .runner_log(&id, query.from.unwrap_or(1), query.follow.unwrap_or(false))
        .await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(output),
    )
        .into_response())
}

fn sse_event(event: &StreamEvent) -> Event {
    let frame = match Event::default().json_data(event) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(%err, "failed to encode stream event");
            return Event::default().comment("unencodable event");
        }
    };
    match event.sequence() {
        Some(sequence) => frame.id(sequence.to_string()),
        None => frame,
    }
}

fn last_event_id(headers: &HeaderMap) -> Option<i64> {
    headers
        .get("last-event-id")?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}
