//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS`, so they are safe
//! to re-run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Create the orchestrator's `session` table.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_session_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS session (
    id              TEXT PRIMARY KEY NOT NULL,
    name            TEXT NOT NULL,
    repo_url        TEXT NOT NULL,
    branch          TEXT NOT NULL,
    workspace_path  TEXT NOT NULL,
    container_id    TEXT,
    status          TEXT NOT NULL CHECK(status IN ('creating','running','stopped','error','archived')),
    status_message  TEXT,
    initial_prompt  TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_session_status ON session(status);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}

/// Create the runner's append-only `message` table.
///
/// `UNIQUE(session_id, sequence)` backs the no-duplicate guarantee even if
/// two writers ever raced past the per-session lock.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_message_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS message (
    id              TEXT PRIMARY KEY NOT NULL,
    session_id      TEXT NOT NULL,
    sequence        INTEGER NOT NULL CHECK(sequence > 0),
    kind            TEXT NOT NULL CHECK(kind IN ('assistant','user','system','result')),
    content         TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    UNIQUE(session_id, sequence)
);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
