//! `SQLite` connection pools and schema bootstrap.
//!
//! The runner's message log is read by the orchestrator from the host
//! through a bind mount, so both stores keep the rollback journal.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::{AppError, Result};

use super::schema;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Which tables to bootstrap on a new pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Store {
    /// Orchestrator session records.
    Sessions,
    /// Runner message log.
    Messages,
}

/// Open (creating if needed) a file-backed database and apply its schema.
///
/// # Errors
///
/// Returns `AppError::Db` if the file cannot be opened or the schema fails.
pub async fn connect(path: impl AsRef<Path>, store: Store) -> Result<SqlitePool> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| AppError::Db(format!("failed to create db dir: {err}")))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;
    bootstrap(&pool, store).await?;
    Ok(pool)
}

/// Open an existing message log without write access.
///
/// # Errors
///
/// Returns `AppError::Db` if the file is missing or unreadable.
pub async fn connect_read_only(path: impl AsRef<Path>) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path.as_ref())
        .read_only(true)
        .busy_timeout(BUSY_TIMEOUT);

    Ok(SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await?)
}

/// Open a private in-memory database holding both stores. Used by tests.
///
/// # Errors
///
/// Returns `AppError::Db` if the connection or schema fails.
pub async fn connect_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    // Every connection to `:memory:` is a separate database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    bootstrap(&pool, Store::Sessions).await?;
    bootstrap(&pool, Store::Messages).await?;
    Ok(pool)
}

async fn bootstrap(pool: &SqlitePool, store: Store) -> Result<()> {
    match store {
        Store::Sessions => schema::bootstrap_session_schema(pool).await,
        Store::Messages => schema::bootstrap_message_schema(pool).await,
    }
}
