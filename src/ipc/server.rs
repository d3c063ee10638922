//! Runner control server.
//!
//! Listens on a Unix domain socket (a named pipe on Windows) inside the
//! container and answers [`ControlRequest`] lines. `start` and `subscribe`
//! switch the connection into streaming mode after their acknowledgement.

use std::io;
use std::path::Path;
use std::sync::Arc;

use interprocess::local_socket::tokio::{prelude::*, RecvHalf, SendHalf};
use interprocess::local_socket::{GenericFilePath, ListenerOptions};
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::protocol::{ControlRequest, ControlResponse};
use crate::agent::AgentRunner;
use crate::events::{Dispatcher, Subscription};
use crate::models::event::StreamEvent;
use crate::persistence::message_log::MessageLog;
use crate::{AppError, Result};

/// Everything a control connection needs.
pub struct ControlState {
    /// Session served by this runner.
    pub session_id: String,
    /// The session's agent runner.
    pub runner: AgentRunner,
    /// The session's message log.
    pub log: MessageLog,
    /// Dispatcher the runner publishes into.
    pub dispatcher: Dispatcher,
}

/// Bind `socket_path` and spawn the accept loop.
///
/// A stale socket file left by a previous runner is removed first.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_control_server(
    socket_path: &Path,
    state: Arc<ControlState>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if socket_path.exists() {
        std::fs::remove_file(socket_path).map_err(|err| {
            AppError::Ipc(format!(
                "failed to remove stale socket {}: {err}",
                socket_path.display()
            ))
        })?;
    }

    let name = socket_path.to_fs_name::<GenericFilePath>().map_err(|err| {
        AppError::Ipc(format!("invalid socket path {}: {err}", socket_path.display()))
    })?;
    let listener = ListenerOptions::new()
        .name(name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create control listener: {err}")))?;

    let socket_display = socket_path.display().to_string();
    info!(socket = %socket_display, "control server listening");

    let handle = tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("control server shutting down");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok(stream) => {
                            let (reader, writer) = stream.split();
                            tokio::spawn(handle_connection(
                                reader,
                                writer,
                                Arc::clone(&state),
                                ct.clone(),
                            ));
                        }
                        Err(err) => warn!(%err, "control accept failed"),
                    },
                }
            }
        }
        .instrument(info_span!("control_server", socket = %socket_display)),
    );
    Ok(handle)
}

async fn handle_connection(
    reader: RecvHalf,
    mut writer: SendHalf,
    state: Arc<ControlState>,
    ct: CancellationToken,
) {
    let span = info_span!("control_conn", session_id = %state.session_id);
    async move {
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            let read = tokio::select! {
                () = ct.cancelled() => break,
                read = reader.read_line(&mut line) => read,
            };
            match read {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let outcome = match serde_json::from_str::<ControlRequest>(trimmed) {
                        Ok(request) => {
                            dispatch(request, &state, &mut reader, &mut writer, &ct).await
                        }
                        Err(err) => {
                            let err = AppError::Validation(format!("invalid request: {err}"));
                            write_line(&mut writer, &ControlResponse::failure(&err))
                                .await
                                .map(|()| true)
                        }
                    };
                    match outcome {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(err) => {
                            debug!(%err, "control client went away");
                            break;
                        }
                    }
                }
                Err(err) => {
                    warn!(%err, "control read error");
                    break;
                }
            }
        }

        debug!("control connection closed");
    }
    .instrument(span)
    .await;
}

/// Answer one request. `Ok(false)` closes the connection.
async fn dispatch(
    request: ControlRequest,
    state: &ControlState,
    reader: &mut BufReader<RecvHalf>,
    writer: &mut SendHalf,
    ct: &CancellationToken,
) -> io::Result<bool> {
    let verb = request.verb();
    debug!(command = verb, "control command");

    let response = match request {
        ControlRequest::Start(options) => {
            let last_sequence = match state.log.last_sequence(&state.session_id).await {
                Ok(last) => last,
                Err(err) => return reply(writer, Err(err)).await,
            };
            match state.runner.start(options).await {
                Ok(subscription) => {
                    write_line(
                        writer,
                        &ControlResponse::success(json!({
                            "started": true,
                            "lastSequence": last_sequence,
                        })),
                    )
                    .await?;
                    return stream_events(subscription, reader, writer, ct, true).await;
                }
                Err(err) => Err(err),
            }
        }
        ControlRequest::Subscribe { after } => {
            match state
                .dispatcher
                .subscribe(&state.session_id, after, Some(&state.log))
                .await
            {
                Ok(subscription) => {
                    write_line(
                        writer,
                        &ControlResponse::success(json!({ "subscribed": true, "after": after })),
                    )
                    .await?;
                    stream_events(subscription, reader, writer, ct, false).await?;
                    return Ok(false);
                }
                Err(err) => Err(err),
            }
        }
        ControlRequest::Interrupt => Ok(json!({ "success": state.runner.interrupt() })),
        ControlRequest::Status => state
            .runner
            .status()
            .await
            .and_then(|status| serde_json::to_value(status).map_err(AppError::from)),
        ControlRequest::Messages { after } => {
            state.log.since(&state.session_id, after).await.map(|messages| {
                let messages: Vec<StreamEvent> =
                    messages.into_iter().map(StreamEvent::message).collect();
                json!({ "messages": messages })
            })
        }
        ControlRequest::Commands => Ok(json!({ "commands": state.runner.supported_commands() })),
        ControlRequest::Health => Ok(json!({ "ok": true })),
    };

    if let Err(err) = &response {
        warn!(command = verb, %err, "control command failed");
    }
    reply(writer, response).await
}

async fn reply(writer: &mut SendHalf, response: Result<serde_json::Value>) -> io::Result<bool> {
    let response = match response {
        Ok(data) => ControlResponse::success(data),
        Err(err) => ControlResponse::failure(&err),
    };
    write_line(writer, &response).await?;
    Ok(true)
}

/// Forward `subscription` to the client.
///
/// Returns `Ok(true)` after a terminal event with the client still connected.
/// A subscription that ends any other way closes the connection.
/// Input received while streaming is discarded.
async fn stream_events(
    mut subscription: Subscription,
    reader: &mut BufReader<RecvHalf>,
    writer: &mut SendHalf,
    ct: &CancellationToken,
    until_terminal: bool,
) -> io::Result<bool> {
    let mut scratch = String::new();
    loop {
        tokio::select! {
            () = ct.cancelled() => return Ok(false),
            read = reader.read_line(&mut scratch) => match read {
                Ok(0) | Err(_) => return Ok(false),
                Ok(_) => scratch.clear(),
            },
            event = subscription.next() => match event {
                None => return Ok(false),
                Some(event) => {
                    write_line(writer, &event).await?;
                    if until_terminal && event.is_terminal() {
                        return Ok(true);
                    }
                }
            },
        }
    }
}

async fn write_line<T: Serialize>(writer: &mut SendHalf, value: &T) -> io::Result<()> {
    let mut line = serde_json::to_string(value).map_err(io::Error::other)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await
}
