//! Error types shared across the orchestrator and the in-container runner.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
///
/// Reconciliation drift has no variant: a container that disagrees with its
/// session record is resolved by a status transition.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Malformed request parameters, rejected before touching any resource.
    Validation(String),
    /// The operation conflicts with the current state (e.g. start while running).
    Conflict(String),
    /// Requested session, container, or file does not exist.
    NotFound(String),
    /// Container engine call failed.
    Runtime(String),
    /// Workspace clone or release failure.
    Workspace(String),
    /// Agent process spawn or stream failure.
    Agent(String),
    /// Control channel communication failure.
    Ipc(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Stable machine-readable code used on the control channel and HTTP API.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Db(_) => "db",
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Runtime(_) => "runtime",
            Self::Workspace(_) => "workspace",
            Self::Agent(_) => "agent",
            Self::Ipc(_) => "ipc",
            Self::Io(_) => "io",
        }
    }

    /// Whether the caller may retry the same request later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Runtime(_) | Self::Ipc(_))
    }

    /// Rebuild an error from a code and message received over the wire.
    ///
    /// Unknown codes map to [`AppError::Ipc`].
    #[must_use]
    pub fn from_code(code: &str, message: String) -> Self {
        match code {
            "config" => Self::Config(message),
            "db" => Self::Db(message),
            "validation" => Self::Validation(message),
            "conflict" => Self::Conflict(message),
            "not_found" => Self::NotFound(message),
            "runtime" => Self::Runtime(message),
            "workspace" => Self::Workspace(message),
            "agent" => Self::Agent(message),
            "io" => Self::Io(message),
            _ => Self::Ipc(message),
        }
    }

    /// The bare message without the category prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Config(msg)
            | Self::Db(msg)
            | Self::Validation(msg)
            | Self::Conflict(msg)
            | Self::NotFound(msg)
            | Self::Runtime(msg)
            | Self::Workspace(msg)
            | Self::Agent(msg)
            | Self::Ipc(msg)
            | Self::Io(msg) => msg,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Runtime(msg) => write!(f, "runtime: {msg}"),
            Self::Workspace(msg) => write!(f, "workspace: {msg}"),
            Self::Agent(msg) => write!(f, "agent: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<bollard::errors::Error> for AppError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => Self::NotFound(message),
            other => Self::Runtime(other.to_string()),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Ipc(format!("invalid json: {err}"))
    }
}
