//! Session repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::session::{Session, SessionStatus};
use crate::{AppError, Result};

const SELECT_COLUMNS: &str = "SELECT id, name, repo_url, branch, workspace_path, container_id, \
     status, status_message, initial_prompt, created_at, updated_at FROM session";

/// Repository wrapper around `SQLite` for session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<SqlitePool>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    name: String,
    repo_url: String,
    branch: String,
    workspace_path: String,
    container_id: Option<String>,
    status: String,
    status_message: Option<String>,
    initial_prompt: Option<String>,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    fn into_session(self) -> Result<Session> {
        Ok(Session {
            status: self.status.parse()?,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
            id: self.id,
            name: self.name,
            repo_url: self.repo_url,
            branch: self.branch,
            workspace_path: self.workspace_path,
            container_id: self.container_id,
            status_message: self.status_message,
            initial_prompt: self.initial_prompt,
        })
    }
}

fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| AppError::Db(format!("invalid {field}: {err}")))
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert a new session record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn create(&self, session: &Session) -> Result<Session> {
        sqlx::query(
            "INSERT INTO session (id, name, repo_url, branch, workspace_path, container_id,
                                  status, status_message, initial_prompt, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(&session.id)
        .bind(&session.name)
        .bind(&session.repo_url)
        .bind(&session.branch)
        .bind(&session.workspace_path)
        .bind(&session.container_id)
        .bind(session.status.as_str())
        .bind(&session.status_message)
        .bind(&session.initial_prompt)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        Ok(session.clone())
    }

    /// Retrieve a session by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn get_by_id(&self, id: &str) -> Result<Session> {
        self.find(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {id}")))
    }

    /// Retrieve a session by identifier, `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn find(&self, id: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(SessionRow::into_session).transpose()
    }

    /// List every session, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY created_at DESC"))
                .fetch_all(self.db.as_ref())
                .await?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// List sessions whose status is one of `statuses`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_by_status(&self, statuses: &[SessionStatus]) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for status in statuses {
            let rows: Vec<SessionRow> = sqlx::query_as(&format!(
                "{SELECT_COLUMNS} WHERE status = ?1 ORDER BY created_at ASC"
            ))
            .bind(status.as_str())
            .fetch_all(self.db.as_ref())
            .await?;
            for row in rows {
                sessions.push(row.into_session()?);
            }
        }
        Ok(sessions)
    }

    /// Record the container created for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn set_container_id(&self, id: &str, container_id: &str) -> Result<Session> {
        let result = sqlx::query(
            "UPDATE session SET container_id = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(container_id)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("session {id}")));
        }
        self.get_by_id(id).await
    }

    /// Replace the status message without changing the status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn set_status_message(&self, id: &str, message: Option<&str>) -> Result<Session> {
        let result =
            sqlx::query("UPDATE session SET status_message = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(message)
                .bind(Utc::now().to_rfc3339())
                .bind(id)
                .execute(self.db.as_ref())
                .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("session {id}")));
        }
        self.get_by_id(id).await
    }

    /// Move a session to `next`, respecting the state machine.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if the transition is not allowed, or
    /// `AppError::NotFound` if the session does not exist.
    pub async fn transition(
        &self,
        id: &str,
        next: SessionStatus,
        message: Option<&str>,
    ) -> Result<Session> {
        let current = self.get_by_id(id).await?;
        if !current.can_transition_to(next) {
            return Err(AppError::Conflict(format!(
                "session {id} cannot move from {} to {next}",
                current.status
            )));
        }

        self.transition_if(
            id,
            current.status,
            current.container_id.as_deref(),
            next,
            message,
        )
        .await?
        .ok_or_else(|| AppError::Conflict(format!("session {id} changed concurrently")))
    }

    /// Move a session to `next` only if its status and container are still
    /// `expected_status` and `expected_container`.
    ///
    /// Returns `None` when the record changed underneath the caller or the
    /// transition is not allowed; the reconciler treats that as "someone
    /// else got there first".
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn transition_if(
        &self,
        id: &str,
        expected_status: SessionStatus,
        expected_container: Option<&str>,
        next: SessionStatus,
        message: Option<&str>,
    ) -> Result<Option<Session>> {
        if !expected_status.allows(next) {
            return Ok(None);
        }

        let result = sqlx::query(
            "UPDATE session SET status = ?1, status_message = ?2, updated_at = ?3
             WHERE id = ?4 AND status = ?5 AND container_id IS ?6",
        )
        .bind(next.as_str())
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .bind(expected_status.as_str())
        .bind(expected_container)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.find(id).await
    }
}
