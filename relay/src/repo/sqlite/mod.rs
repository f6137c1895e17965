//! SQLite reference implementations of the repository contracts.
//!
//! One file-backed database holds users, conversations, messages, and plans.
//! Every call opens its own connection inside `spawn_blocking`, keeping the
//! async runtime free of blocking I/O.

mod conversations;
mod messages;
mod plans;
mod users;

pub use conversations::SqliteConversationRepo;
pub use messages::SqliteMessageRepo;
pub use plans::SqlitePlanRepo;
pub use users::SqliteUserRepo;

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use super::RepoError;

/// Shared handle: schema setup once, a fresh connection per call.
#[derive(Clone)]
pub struct SqliteDb {
    path: PathBuf,
}

impl SqliteDb {
    /// Opens (creating if needed) the database and ensures the schema.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, RepoError> {
        let db = Self {
            path: path.as_ref().to_path_buf(),
        };
        let conn = db.open()?;
        conn.execute_batch(SCHEMA).map_err(storage)?;
        Ok(db)
    }

    pub(crate) fn open(&self) -> Result<Connection, RepoError> {
        Connection::open(&self.path).map_err(storage)
    }

    /// Runs `f` with a fresh connection on the blocking pool.
    pub(crate) async fn with_conn<T, F>(&self, f: F) -> Result<T, RepoError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, RepoError> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.open()?;
            f(&conn)
        })
        .await
        .map_err(|e| RepoError::Storage(e.to_string()))?
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_active_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    is_archived INTEGER NOT NULL DEFAULT 0,
    archived_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id, updated_at);
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    thinking TEXT,
    sources TEXT NOT NULL DEFAULT '[]',
    token_usage TEXT,
    duration_ms INTEGER,
    created_at TEXT NOT NULL,
    client_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_client
    ON messages(conversation_id, client_id) WHERE client_id IS NOT NULL;
CREATE TABLE IF NOT EXISTS plans (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    goal TEXT NOT NULL,
    tasks TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_plans_user ON plans(user_id, updated_at);
"#;

pub(crate) fn storage(e: rusqlite::Error) -> RepoError {
    RepoError::Storage(e.to_string())
}

/// Uniform-width RFC3339 so lexicographic ordering matches time ordering.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
pub(crate) fn test_db() -> (tempfile::TempDir, SqliteDb) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = SqliteDb::new(dir.path().join("test.db")).expect("open test db");
    (dir, db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_round_trip_and_sort() {
        let a = Utc::now();
        let b = a + chrono::Duration::seconds(1);
        assert!(ts(a) < ts(b));
        assert_eq!(parse_ts(&ts(a)).timestamp_micros(), a.timestamp_micros());
    }
}
