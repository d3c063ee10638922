//! Read access to runner message logs from the host.
//!
//! Each runner writes `messages.db` into its session data directory, which is
//! bind-mounted from the host. The orchestrator opens those files read-only;
//! the runner stays the sole writer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::models::message::{MessagePage, MessageRange};
use crate::persistence::db;
use crate::persistence::message_log::MessageLog;
use crate::Result;

/// File name of the runner's message log inside the session data directory.
pub const MESSAGE_DB_FILE: &str = "messages.db";

/// Lazily opened, cached read-only message logs keyed by session id.
#[derive(Clone)]
pub struct LogStore {
    data_root: PathBuf,
    open: Arc<Mutex<HashMap<String, MessageLog>>>,
}

impl LogStore {
    /// Store reading logs under `data_root/<session_id>/`.
    #[must_use]
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            open: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Host path of the log for `session_id`.
    #[must_use]
    pub fn path(&self, session_id: &str) -> PathBuf {
        self.data_root.join(session_id).join(MESSAGE_DB_FILE)
    }

    /// The session's log, or `None` until its runner has created one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if an existing log cannot be opened.
    pub async fn get(&self, session_id: &str) -> Result<Option<MessageLog>> {
        let mut open = self.open.lock().await;
        if let Some(log) = open.get(session_id) {
            return Ok(Some(log.clone()));
        }

        let path = self.path(session_id);
        if !path.is_file() {
            return Ok(None);
        }
        debug!(session_id, path = %path.display(), "opening message log");
        let pool = db::connect_read_only(&path).await?;
        let log = MessageLog::new(Arc::new(pool));
        open.insert(session_id.to_owned(), log.clone());
        Ok(Some(log))
    }

    /// Page through a session's messages; empty when no log exists yet.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the log cannot be read.
    pub async fn page(&self, session_id: &str, range: MessageRange) -> Result<MessagePage> {
        match self.get(session_id).await? {
            Some(log) => log.get_range(session_id, range).await,
            None => Ok(MessagePage::default()),
        }
    }

    /// Highest persisted sequence, `0` when nothing is readable yet.
    pub async fn last_sequence(&self, session_id: &str) -> i64 {
        let log = match self.get(session_id).await {
            Ok(Some(log)) => log,
            Ok(None) => return 0,
            Err(err) => {
                debug!(session_id, %err, "message log not readable");
                return 0;
            }
        };
        match log.last_sequence(session_id).await {
            Ok(last) => last,
            Err(err) => {
                // The runner may still be creating its schema.
                debug!(session_id, %err, "message log not readable");
                0
            }
        }
    }

    /// Close and forget the cached log of `session_id`.
    pub async fn evict(&self, session_id: &str) {
        if let Some(log) = self.open.lock().await.remove(session_id) {
            log.close().await;
        }
    }
}
