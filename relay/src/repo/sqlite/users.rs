//! SQLite-backed user repository.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::{parse_ts, storage, ts, SqliteDb};
use crate::repo::{RepoError, User, UserRepo};

pub struct SqliteUserRepo {
    db: SqliteDb,
}

impl SqliteUserRepo {
    pub fn new(db: SqliteDb) -> Self {
        Self { db }
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        display_name: row.get(1)?,
        created_at: parse_ts(&row.get::<_, String>(2)?),
        last_active_at: parse_ts(&row.get::<_, String>(3)?),
    })
}

#[async_trait]
impl UserRepo for SqliteUserRepo {
    async fn get_or_create(&self, id: &str, display_name: Option<&str>) -> Result<User, RepoError> {
        if id.trim().is_empty() {
            return Err(RepoError::InvalidInput("user id must not be empty".into()));
        }
        let id = id.to_string();
        let name = display_name.unwrap_or(&id).to_string();
        let now = ts(Utc::now());
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO users (id, display_name, created_at, last_active_at)
                    VALUES (?1, ?2, ?3, ?3)
                    ON CONFLICT(id) DO UPDATE SET last_active_at = excluded.last_active_at
                    "#,
                    params![id, name, now],
                )
                .map_err(storage)?;
                conn.query_row(
                    "SELECT id, display_name, created_at, last_active_at FROM users WHERE id = ?1",
                    params![id],
                    row_to_user,
                )
                .map_err(storage)
            })
            .await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<User>, RepoError> {
        let id = id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, display_name, created_at, last_active_at FROM users WHERE id = ?1",
                    params![id],
                    row_to_user,
                )
                .optional()
                .map_err(storage)
            })
            .await
    }
}
