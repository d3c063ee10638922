//! Events delivered to stream subscribers.
//!
//! The same shapes travel over the runner control channel (one JSON object
//! per line) and the orchestrator's SSE endpoints (one object per frame):
//!
//! ```json
//! {"sequence": 1, "message": { ... }}
//! {"partial": {"sequence": 2, "content": { ... }}}
//! {"done": true, "interrupted": false}
//! {"error": "agent exited with status 1"}
//! {"session": { ... }}
//! {"lagged": true, "resumeAfter": 7}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::Message;
use super::session::Session;

/// Transient preview of an in-progress agent turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartialMessage {
    /// Sequence the complete message is expected to take. A hint only.
    pub sequence: i64,
    /// Accumulated preview content.
    pub content: Value,
}

/// One event on a session stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StreamEvent {
    /// A complete, persisted message.
    Message {
        /// Sequence of `message`, repeated for cursor tracking.
        sequence: i64,
        /// The persisted message.
        message: Message,
    },
    /// A coalesced partial preview.
    Partial {
        /// Preview payload.
        partial: PartialMessage,
    },
    /// The current query finished.
    Done {
        /// Always `true`.
        done: bool,
        /// Whether the query ended because of an interrupt.
        #[serde(default)]
        interrupted: bool,
    },
    /// The current query failed.
    Error {
        /// Human-readable failure.
        error: String,
    },
    /// The session record changed.
    Session {
        /// Updated record.
        session: Session,
    },
    /// The subscriber fell behind and was dropped. Not a query outcome:
    /// reconnect with `resume_after` as the cursor.
    Lagged {
        /// Always `true`.
        lagged: bool,
        /// Last complete-message sequence this subscriber received.
        #[serde(rename = "resumeAfter")]
        resume_after: i64,
    },
}

impl StreamEvent {
    /// Wrap a persisted message.
    #[must_use]
    pub fn message(message: Message) -> Self {
        Self::Message {
            sequence: message.sequence,
            message,
        }
    }

    /// Terminal success event.
    #[must_use]
    pub fn done(interrupted: bool) -> Self {
        Self::Done {
            done: true,
            interrupted,
        }
    }

    /// Terminal failure event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    /// Overflow notice for a dropped subscriber.
    #[must_use]
    pub fn lagged(resume_after: i64) -> Self {
        Self::Lagged {
            lagged: true,
            resume_after,
        }
    }

    /// Sequence of a complete message event.
    #[must_use]
    pub fn sequence(&self) -> Option<i64> {
        match self {
            Self::Message { sequence, .. } => Some(*sequence),
            _ => None,
        }
    }

    /// Whether this event ends a query stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
