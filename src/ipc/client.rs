//! Orchestrator-side client for the runner control channel.

use std::path::{Path, PathBuf};
use std::time::Duration;

use interprocess::local_socket::tokio::{prelude::*, RecvHalf, SendHalf};
use interprocess::local_socket::GenericFilePath;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};

use super::protocol::{ControlRequest, ControlResponse};
use crate::agent::process::QueryOptions;
use crate::agent::RunnerStatus;
use crate::models::event::StreamEvent;
use crate::models::message::Message;
use crate::{AppError, Result};

/// Upper bound for a single request/response exchange.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects to one runner's control socket. Each call opens a fresh
/// connection.
#[derive(Debug, Clone)]
pub struct RunnerClient {
    path: PathBuf,
}

impl RunnerClient {
    /// Client for the socket at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Socket path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Liveness probe.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` if the runner does not answer.
    pub async fn health(&self) -> Result<()> {
        self.request(&ControlRequest::Health).await.map(|_| ())
    }

    /// Runner status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` on channel failure.
    pub async fn status(&self) -> Result<RunnerStatus> {
        self.request_as(&ControlRequest::Status).await
    }

    /// Interrupt the active query; `false` when the runner was idle.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` on channel failure.
    pub async fn interrupt(&self) -> Result<bool> {
        let data = self.request(&ControlRequest::Interrupt).await?;
        Ok(data.get("success").and_then(Value::as_bool).unwrap_or(false))
    }

    /// Persisted messages after `after`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` on channel failure.
    pub async fn messages_since(&self, after: i64) -> Result<Vec<Message>> {
        let data = self.request(&ControlRequest::Messages { after }).await?;
        let events: Vec<StreamEvent> = serde_json::from_value(
            data.get("messages").cloned().unwrap_or(Value::Array(Vec::new())),
        )?;
        Ok(events
            .into_iter()
            .filter_map(|event| match event {
                StreamEvent::Message { message, .. } => Some(message),
                _ => None,
            })
            .collect())
    }

    /// Slash commands advertised by the agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` on channel failure.
    pub async fn commands(&self) -> Result<Vec<String>> {
        let data = self.request(&ControlRequest::Commands).await?;
        Ok(serde_json::from_value(
            data.get("commands").cloned().unwrap_or(Value::Array(Vec::new())),
        )?)
    }

    /// Launch a query and return its event stream.
    ///
    /// # Errors
    ///
    /// Returns the runner's error (`Validation`, `Conflict`, `Agent`) when the
    /// query is refused, or `AppError::Ipc` on channel failure.
    pub async fn start(&self, options: QueryOptions) -> Result<EventStream> {
        let mut conn = Connection::open(&self.path).await?;
        let ack = tokio::time::timeout(
            REQUEST_TIMEOUT,
            conn.call(&ControlRequest::Start(options)),
        )
        .await
        .map_err(|_| AppError::Ipc("runner did not acknowledge start".into()))??;
        ack.into_result()?;
        Ok(conn.into_events())
    }

    /// Stream persisted messages after `after`, then live events.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` on channel failure.
    pub async fn subscribe(&self, after: i64) -> Result<EventStream> {
        let mut conn = Connection::open(&self.path).await?;
        let ack = tokio::time::timeout(
            REQUEST_TIMEOUT,
            conn.call(&ControlRequest::Subscribe { after }),
        )
        .await
        .map_err(|_| AppError::Ipc("runner did not acknowledge subscribe".into()))??;
        ack.into_result()?;
        Ok(conn.into_events())
    }

    async fn request(&self, request: &ControlRequest) -> Result<Value> {
        let exchange = async {
            let mut conn = Connection::open(&self.path).await?;
            conn.call(request).await
        };
        tokio::time::timeout(REQUEST_TIMEOUT, exchange)
            .await
            .map_err(|_| AppError::Ipc(format!("runner did not answer {}", request.verb())))??
            .into_result()
    }

    async fn request_as<T: DeserializeOwned>(&self, request: &ControlRequest) -> Result<T> {
        Ok(serde_json::from_value(self.request(request).await?)?)
    }
}

struct Connection {
    lines: Lines<BufReader<RecvHalf>>,
    writer: SendHalf,
}

impl Connection {
    async fn open(path: &Path) -> Result<Self> {
        let name = path.to_fs_name::<GenericFilePath>().map_err(|err| {
            AppError::Ipc(format!("invalid socket path {}: {err}", path.display()))
        })?;
        let stream = LocalSocketStream::connect(name).await.map_err(|err| {
            AppError::Ipc(format!("failed to connect to {}: {err}", path.display()))
        })?;
        let (reader, writer) = stream.split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    async fn call(&mut self, request: &ControlRequest) -> Result<ControlResponse> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|err| AppError::Ipc(format!("failed to send request: {err}")))?;

        let reply = self
            .lines
            .next_line()
            .await
            .map_err(|err| AppError::Ipc(format!("failed to read response: {err}")))?
            .ok_or_else(|| AppError::Ipc("runner closed the connection".into()))?;
        Ok(serde_json::from_str(&reply)?)
    }

    fn into_events(self) -> EventStream {
        EventStream {
            lines: self.lines,
            _writer: self.writer,
        }
    }
}

/// Events streamed by the runner after a `start` or `subscribe`.
pub struct EventStream {
    lines: Lines<BufReader<RecvHalf>>,
    // Dropping the write half would end the runner-side stream.
    _writer: SendHalf,
}

impl EventStream {
    /// Next event, or `None` when the runner closed the stream.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` on read failure or an undecodable line.
    pub async fn next(&mut self) -> Result<Option<StreamEvent>> {
        loop {
            let Some(line) = self
                .lines
                .next_line()
                .await
                .map_err(|err| AppError::Ipc(format!("runner stream failed: {err}")))?
            else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(&line)?));
        }
    }
}
