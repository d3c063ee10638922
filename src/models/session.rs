//! Session model and lifecycle helpers.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppError;

/// Status message recorded while the workspace checkout is in progress.
pub const CLONING_MESSAGE: &str = "Cloning repository…";

/// Lifecycle status for a container-backed agent session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Record persisted; workspace and container are being provisioned.
    Creating,
    /// Container running with a runner attached.
    Running,
    /// Container stopped but retained.
    Stopped,
    /// A lifecycle step failed; see the status message.
    Error,
    /// Resources released, history retained read-only. Terminal.
    Archived,
}

impl SessionStatus {
    /// Lower-case name as stored in the database and sent over the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Archived => "archived",
        }
    }
}

impl SessionStatus {
    /// Whether a session in this status may move to `next`.
    ///
    /// `archived` accepts nothing; every other state may be archived.
    #[must_use]
    pub fn allows(self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (
                Self::Creating,
                Self::Running | Self::Error | Self::Archived
            ) | (
                Self::Running,
                Self::Stopped | Self::Error | Self::Archived
            ) | (
                Self::Stopped,
                Self::Running | Self::Error | Self::Archived
            ) | (
                Self::Error,
                Self::Running | Self::Stopped | Self::Archived
            )
        )
    }
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            "archived" => Ok(Self::Archived),
            other => Err(AppError::Db(format!("invalid session status: {other}"))),
        }
    }
}

/// Session domain entity persisted in `SQLite`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique record identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Repository URL or `owner/name` shorthand as requested.
    pub repo_url: String,
    /// Branch checked out into the workspace.
    pub branch: String,
    /// Host path of the workspace checkout.
    pub workspace_path: String,
    /// Engine container id; set once a container was ever created.
    pub container_id: Option<String>,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Human-readable detail about the current status.
    pub status_message: Option<String>,
    /// Prompt sent to the agent once the session first reaches `running`.
    pub initial_prompt: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Construct a new `creating` session with a generated identifier.
    #[must_use]
    pub fn new(
        name: String,
        repo_url: String,
        branch: String,
        initial_prompt: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            repo_url,
            branch,
            workspace_path: String::new(),
            container_id: None,
            status: SessionStatus::Creating,
            status_message: Some(CLONING_MESSAGE.to_owned()),
            initial_prompt,
            created_at: now,
            updated_at: now,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        self.status.allows(next)
    }

    /// Whether the session has reached its terminal state.
    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.status == SessionStatus::Archived
    }
}
