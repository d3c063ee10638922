//! Append-only, per-session sequenced message log.
//!
//! `append` assigns `last + 1` inside a transaction while holding the
//! session's write lock, so persisted sequences start at 1 and never skip
//! or repeat. Partial previews never pass through here.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::locks::KeyedLocks;
use crate::models::message::{Message, MessageKind, MessagePage, MessageRange};
use crate::{AppError, Result};

/// Sequencer and reader over the `message` table.
#[derive(Clone)]
pub struct MessageLog {
    db: Arc<SqlitePool>,
    writers: KeyedLocks,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    session_id: String,
    sequence: i64,
    kind: String,
    content: String,
    created_at: String,
}

impl MessageRow {
    fn into_message(self) -> Result<Message> {
        let content: Value = serde_json::from_str(&self.content)
            .map_err(|err| AppError::Db(format!("invalid message content: {err}")))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|err| AppError::Db(format!("invalid created_at: {err}")))?
            .with_timezone(&Utc);

        Ok(Message {
            id: self.id,
            session_id: self.session_id,
            sequence: self.sequence,
            kind: self.kind.parse()?,
            content,
            created_at,
        })
    }
}

impl MessageLog {
    /// Create a log over an already bootstrapped pool.
    #[must_use]
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self {
            db,
            writers: KeyedLocks::new(),
        }
    }

    /// Persist a complete message and return it with its assigned sequence.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the transaction fails; no sequence is
    /// consumed in that case.
    pub async fn append(
        &self,
        session_id: &str,
        kind: MessageKind,
        content: Value,
    ) -> Result<Message> {
        let _guard = self.writers.lock(session_id).await;

        let mut tx = self.db.begin().await?;
        let last: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(sequence), 0) FROM message WHERE session_id = ?1")
                .bind(session_id)
                .fetch_one(&mut *tx)
                .await?;

        let message = Message {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_owned(),
            sequence: last + 1,
            kind,
            content,
            created_at: Utc::now(),
        };
        let encoded = serde_json::to_string(&message.content)
            .map_err(|err| AppError::Db(format!("unencodable message content: {err}")))?;

        sqlx::query(
            "INSERT INTO message (id, session_id, sequence, kind, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.sequence)
        .bind(message.kind.as_str())
        .bind(encoded)
        .bind(message.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(message)
    }

    /// Read one page of messages in ascending order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_range(&self, session_id: &str, range: MessageRange) -> Result<MessagePage> {
        let page = i64::from(range.page_size());
        let lower = range.after.unwrap_or(0);
        let upper = range.before.unwrap_or(i64::MAX);

        // Forward paging only when the caller anchored on `after` alone.
        let ascending = range.after.is_some() && range.before.is_none();
        let sql = if ascending {
            "SELECT id, session_id, sequence, kind, content, created_at FROM message
             WHERE session_id = ?1 AND sequence > ?2 AND sequence < ?3
             ORDER BY sequence ASC LIMIT ?4"
        } else {
            "SELECT id, session_id, sequence, kind, content, created_at FROM message
             WHERE session_id = ?1 AND sequence > ?2 AND sequence < ?3
             ORDER BY sequence DESC LIMIT ?4"
        };

        let mut rows: Vec<MessageRow> = sqlx::query_as(sql)
            .bind(session_id)
            .bind(lower)
            .bind(upper)
            .bind(page + 1)
            .fetch_all(self.db.as_ref())
            .await?;

        let has_more = i64::try_from(rows.len()).unwrap_or(i64::MAX) > page;
        rows.truncate(usize::try_from(page).unwrap_or(usize::MAX));
        if !ascending {
            rows.reverse();
        }

        let messages = rows
            .into_iter()
            .map(MessageRow::into_message)
            .collect::<Result<Vec<_>>>()?;
        Ok(MessagePage { messages, has_more })
    }

    /// Every message after `cursor`, ascending.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn since(&self, session_id: &str, cursor: i64) -> Result<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, session_id, sequence, kind, content, created_at FROM message
             WHERE session_id = ?1 AND sequence > ?2
             ORDER BY sequence ASC",
        )
        .bind(session_id)
        .bind(cursor)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(MessageRow::into_message).collect()
    }

    /// Highest persisted sequence, 0 for an empty log.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn last_sequence(&self, session_id: &str) -> Result<i64> {
        let last: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(sequence), 0) FROM message WHERE session_id = ?1")
                .bind(session_id)
                .fetch_one(self.db.as_ref())
                .await?;
        Ok(last)
    }

    /// Most recent message of `kind`, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn latest_of_kind(
        &self,
        session_id: &str,
        kind: MessageKind,
    ) -> Result<Option<Message>> {
        let row: Option<MessageRow> = sqlx::query_as(
            "SELECT id, session_id, sequence, kind, content, created_at FROM message
             WHERE session_id = ?1 AND kind = ?2
             ORDER BY sequence DESC LIMIT 1",
        )
        .bind(session_id)
        .bind(kind.as_str())
        .fetch_optional(self.db.as_ref())
        .await?;

        row.map(MessageRow::into_message).transpose()
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.db.close().await;
    }
}
