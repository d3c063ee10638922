//! Wire types of the runner control channel.
//!
//! One JSON object per line in each direction.
//!
//! ```json
//! {"command": "start", "prompt": "List the files", "model": "sonnet"}
//! {"command": "subscribe", "after": 10}
//! {"command": "interrupt"}
//! {"command": "status"}
//! {"command": "messages", "after": 0}
//! {"command": "commands"}
//! {"command": "health"}
//! ```
//!
//! Every request is answered by one [`ControlResponse`]. After a successful
//! `start` or `subscribe` acknowledgement the connection carries
//! [`StreamEvent`](crate::models::event::StreamEvent) lines until the stream
//! ends or the client disconnects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::process::QueryOptions;
use crate::AppError;

/// Inbound control command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ControlRequest {
    /// Launch a query and stream its events.
    Start(QueryOptions),
    /// Stream persisted messages after `after`, then live events.
    Subscribe {
        #[serde(default)]
        after: i64,
    },
    /// Interrupt the active query.
    Interrupt,
    /// Report runner status.
    Status,
    /// Return persisted messages after `after`.
    Messages {
        #[serde(default)]
        after: i64,
    },
    /// Return the agent's advertised slash commands.
    Commands,
    /// Liveness probe.
    Health,
}

impl ControlRequest {
    /// Command verb, for logging.
    #[must_use]
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Subscribe { .. } => "subscribe",
            Self::Interrupt => "interrupt",
            Self::Status => "status",
            Self::Messages { .. } => "messages",
            Self::Commands => "commands",
            Self::Health => "health",
        }
    }
}

/// Outbound control response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error category on failure, as in [`AppError::code`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ControlResponse {
    /// Successful response carrying `data`.
    #[must_use]
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    /// Failed response describing `err`.
    #[must_use]
    pub fn failure(err: &AppError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(err.message().to_owned()),
            code: Some(err.code().to_owned()),
        }
    }

    /// Convert back into a `Result`, restoring the error category.
    ///
    /// # Errors
    ///
    /// Returns the transported error when `ok` is false.
    pub fn into_result(self) -> crate::Result<Value> {
        if self.ok {
            return Ok(self.data.unwrap_or(Value::Null));
        }
        let message = self.error.unwrap_or_else(|| "unknown runner error".to_owned());
        Err(match self.code {
            Some(code) => AppError::from_code(&code, message),
            None => AppError::Ipc(message),
        })
    }
}
