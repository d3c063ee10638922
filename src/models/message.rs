//! Sequenced conversation messages and the agent output they are parsed from.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::AppError;

/// Persisted message category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Agent output (text, tool use).
    Assistant,
    /// User turn or tool results echoed by the agent.
    User,
    /// Agent bookkeeping such as the init banner.
    System,
    /// End-of-turn summary.
    Result,
}

impl MessageKind {
    /// Lower-case name as stored in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assistant => "assistant",
            Self::User => "user",
            Self::System => "system",
            Self::Result => "result",
        }
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assistant" => Ok(Self::Assistant),
            "user" => Ok(Self::User),
            "system" => Ok(Self::System),
            "result" => Ok(Self::Result),
            other => Err(AppError::Db(format!("invalid message kind: {other}"))),
        }
    }
}

/// A complete, persisted message. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique record identifier.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// Position in the session log, starting at 1 with no gaps.
    pub sequence: i64,
    /// Message category.
    pub kind: MessageKind,
    /// Agent payload, stored verbatim.
    pub content: Value,
    /// Append timestamp.
    pub created_at: DateTime<Utc>,
}

/// One unit of agent output, classified by its `type` field.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    /// Complete assistant turn.
    Assistant(Value),
    /// Complete user turn (typically tool results).
    User(Value),
    /// System notice; `subtype = "init"` advertises capabilities.
    System(Value),
    /// End-of-query summary.
    Result(Value),
    /// Incremental stream event used only for partial previews.
    Partial(Value),
    /// Anything unrecognised or unparseable, kept as the raw line.
    Raw(String),
}

impl AgentMessage {
    /// Persisted kind for complete messages, `None` for partial and raw output.
    #[must_use]
    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            Self::Assistant(_) => Some(MessageKind::Assistant),
            Self::User(_) => Some(MessageKind::User),
            Self::System(_) => Some(MessageKind::System),
            Self::Result(_) => Some(MessageKind::Result),
            Self::Partial(_) | Self::Raw(_) => None,
        }
    }

    /// Consume into the JSON payload, wrapping raw text as a string value.
    #[must_use]
    pub fn into_content(self) -> Value {
        match self {
            Self::Assistant(v)
            | Self::User(v)
            | Self::System(v)
            | Self::Result(v)
            | Self::Partial(v) => v,
            Self::Raw(line) => Value::String(line),
        }
    }
}

/// A page of messages in ascending sequence order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    /// Messages, oldest first.
    pub messages: Vec<Message>,
    /// Whether more messages exist beyond this page in the paging direction.
    pub has_more: bool,
}

/// Cursor window for [`MessagePage`] queries.
///
/// With only `after` set the page walks forward from the cursor. With
/// `before` set (or neither) the page holds the newest messages below the
/// bound, which is how a live tail and backward backfill are read.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
pub struct MessageRange {
    /// Exclusive lower bound.
    pub after: Option<i64>,
    /// Exclusive upper bound.
    pub before: Option<i64>,
    /// Maximum messages returned; clamped to `1..=MAX_PAGE`.
    pub limit: Option<u32>,
}

impl MessageRange {
    /// Default page size.
    pub const DEFAULT_PAGE: u32 = 50;
    /// Largest page size honoured.
    pub const MAX_PAGE: u32 = 500;

    /// Forward page starting after `cursor`.
    #[must_use]
    pub fn after(cursor: i64, limit: u32) -> Self {
        Self {
            after: Some(cursor),
            before: None,
            limit: Some(limit),
        }
    }

    /// Effective page size.
    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.limit
            .unwrap_or(Self::DEFAULT_PAGE)
            .clamp(1, Self::MAX_PAGE)
    }
}
