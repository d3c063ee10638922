//! Classification of the agent CLI's `stream-json` output.
//!
//! | `type`          | Maps to                          |
//! |-----------------|----------------------------------|
//! | `assistant`     | [`AgentMessage::Assistant`]      |
//! | `user`          | [`AgentMessage::User`]           |
//! | `system`        | [`AgentMessage::System`]         |
//! | `result`        | [`AgentMessage::Result`]         |
//! | `stream_event`  | [`AgentMessage::Partial`]        |
//! | *(other / bad)* | [`AgentMessage::Raw`]            |

use serde_json::{json, Value};

use crate::models::message::AgentMessage;

/// Classify one output line. Blank lines yield `None`; nothing here fails.
#[must_use]
pub fn parse_line(line: &str) -> Option<AgentMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return Some(AgentMessage::Raw(trimmed.to_owned()));
    };

    let message = match value.get("type").and_then(Value::as_str) {
        Some("assistant") => AgentMessage::Assistant(value),
        Some("user") => AgentMessage::User(value),
        Some("system") => AgentMessage::System(value),
        Some("result") => AgentMessage::Result(value),
        Some("stream_event") => AgentMessage::Partial(value),
        _ => AgentMessage::Raw(trimmed.to_owned()),
    };
    Some(message)
}

/// Slash commands advertised by a `system`/`init` message.
#[must_use]
pub fn advertised_commands(system: &Value) -> Option<Vec<String>> {
    if system.get("subtype").and_then(Value::as_str) != Some("init") {
        return None;
    }
    let commands = system.get("slash_commands")?.as_array()?;
    Some(
        commands
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
    )
}

/// The agent's own conversation id, used to resume the conversation.
#[must_use]
pub fn conversation_id(message: &Value) -> Option<&str> {
    message.get("session_id").and_then(Value::as_str)
}

/// Accumulates text deltas of the in-progress assistant turn.
#[derive(Debug, Default)]
pub struct PartialPreview {
    text: String,
}

impl PartialPreview {
    /// Fold a `stream_event` into the preview.
    ///
    /// Returns the updated preview content when the visible text changed.
    pub fn apply(&mut self, stream_event: &Value) -> Option<Value> {
        let event = stream_event.get("event").unwrap_or(stream_event);
        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                self.text.clear();
                None
            }
            Some("content_block_delta") => {
                let delta = event.get("delta")?;
                if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
                    return None;
                }
                let chunk = delta.get("text").and_then(Value::as_str)?;
                if chunk.is_empty() {
                    return None;
                }
                self.text.push_str(chunk);
                Some(json!({ "type": "assistant", "text": self.text }))
            }
            _ => None,
        }
    }

    /// Forget the current turn once its complete message arrives.
    pub fn reset(&mut self) {
        self.text.clear();
    }
}
