//! SQLite-backed conversation repository, including the archival surface
//! used by the LRU scheduler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{parse_ts, storage, ts, SqliteDb};
use crate::repo::{Conversation, ConversationRepo, Page, RepoError};

pub struct SqliteConversationRepo {
    db: SqliteDb,
}

impl SqliteConversationRepo {
    pub fn new(db: SqliteDb) -> Self {
        Self { db }
    }
}

const COLUMNS: &str = "id, user_id, title, message_count, created_at, updated_at, \
                       last_accessed_at, is_active, is_archived, archived_at";

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        message_count: row.get(3)?,
        created_at: parse_ts(&row.get::<_, String>(4)?),
        updated_at: parse_ts(&row.get::<_, String>(5)?),
        last_accessed_at: parse_ts(&row.get::<_, String>(6)?),
        is_active: row.get::<_, i64>(7)? != 0,
        is_archived: row.get::<_, i64>(8)? != 0,
        archived_at: row.get::<_, Option<String>>(9)?.map(|s| parse_ts(&s)),
    })
}

fn query_list(
    conn: &rusqlite::Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<Conversation>, RepoError> {
    let mut stmt = conn.prepare(sql).map_err(storage)?;
    let rows = stmt
        .query_map(args, row_to_conversation)
        .map_err(storage)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(storage)?;
    Ok(rows)
}

#[async_trait]
impl ConversationRepo for SqliteConversationRepo {
    async fn save(&self, conversation: &Conversation) -> Result<(), RepoError> {
        let c = conversation.clone();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO conversations
                        (id, user_id, title, message_count, created_at, updated_at,
                         last_accessed_at, is_active, is_archived, archived_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                    ON CONFLICT(id) DO UPDATE SET
                        title = excluded.title,
                        message_count = excluded.message_count,
                        updated_at = excluded.updated_at,
                        last_accessed_at = excluded.last_accessed_at,
                        is_active = excluded.is_active,
                        is_archived = excluded.is_archived,
                        archived_at = excluded.archived_at
                    "#,
                    params![
                        c.id,
                        c.user_id,
                        c.title,
                        c.message_count,
                        ts(c.created_at),
                        ts(c.updated_at),
                        ts(c.last_accessed_at),
                        c.is_active as i64,
                        c.is_archived as i64,
                        c.archived_at.map(ts),
                    ],
                )
                .map_err(storage)?;
                Ok(())
            })
            .await
    }

    async fn find_by_id(&self, id: &str, user_id: &str) -> Result<Option<Conversation>, RepoError> {
        let (id, user_id) = (id.to_string(), user_id.to_string());
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    &format!("SELECT {COLUMNS} FROM conversations WHERE id = ?1 AND user_id = ?2"),
                    params![id, user_id],
                    row_to_conversation,
                )
                .optional()
                .map_err(storage)
            })
            .await
    }

    async fn find_by_user(
        &self,
        user_id: &str,
        limit: u32,
        skip: u32,
    ) -> Result<Page<Conversation>, RepoError> {
        let user_id = user_id.to_string();
        self.db
            .with_conn(move |conn| {
                let total: u64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM conversations
                         WHERE user_id = ?1 AND is_active = 1 AND is_archived = 0",
                        params![user_id],
                        |row| row.get::<_, i64>(0),
                    )
                    .map_err(storage)? as u64;
                let items = query_list(
                    conn,
                    &format!(
                        "SELECT {COLUMNS} FROM conversations
                         WHERE user_id = ?1 AND is_active = 1 AND is_archived = 0
                         ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3"
                    ),
                    params![user_id, limit as i64, skip as i64],
                )?;
                Ok(Page { items, total })
            })
            .await
    }

    async fn update_title(&self, id: &str, user_id: &str, title: &str) -> Result<(), RepoError> {
        let (id, user_id, title) = (id.to_string(), user_id.to_string(), title.to_string());
        let now = ts(Utc::now());
        self.db
            .with_conn(move |conn| {
                // Title edits do not count as message activity: message_count
                // stays untouched here.
                let changed = conn
                    .execute(
                        "UPDATE conversations SET title = ?1, updated_at = ?2
                         WHERE id = ?3 AND user_id = ?4",
                        params![title, now, id, user_id],
                    )
                    .map_err(storage)?;
                if changed == 0 {
                    return Err(RepoError::NotFound);
                }
                Ok(())
            })
            .await
    }

    async fn touch(&self, id: &str, user_id: &str) -> Result<(), RepoError> {
        let (id, user_id) = (id.to_string(), user_id.to_string());
        let now = ts(Utc::now());
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE conversations SET last_accessed_at = ?1 WHERE id = ?2 AND user_id = ?3",
                    params![now, id, user_id],
                )
                .map_err(storage)?;
                Ok(())
            })
            .await
    }

    async fn record_message_append(&self, id: &str) -> Result<(), RepoError> {
        let id = id.to_string();
        let now = ts(Utc::now());
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE conversations
                     SET message_count = message_count + 1, updated_at = ?1, last_accessed_at = ?1
                     WHERE id = ?2",
                    params![now, id],
                )
                .map_err(storage)?;
                Ok(())
            })
            .await
    }

    async fn soft_delete(&self, id: &str, user_id: &str) -> Result<(), RepoError> {
        let (id, user_id) = (id.to_string(), user_id.to_string());
        self.db
            .with_conn(move |conn| {
                let changed = conn
                    .execute(
                        "UPDATE conversations SET is_active = 0, is_archived = 0, archived_at = NULL
                         WHERE id = ?1 AND user_id = ?2",
                        params![id, user_id],
                    )
                    .map_err(storage)?;
                if changed == 0 {
                    return Err(RepoError::NotFound);
                }
                Ok(())
            })
            .await
    }

    async fn count_active(&self, user_id: &str) -> Result<u64, RepoError> {
        let user_id = user_id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM conversations
                     WHERE user_id = ?1 AND is_active = 1 AND is_archived = 0",
                    params![user_id],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n as u64)
                .map_err(storage)
            })
            .await
    }

    async fn list_active_stalest_first(
        &self,
        user_id: &str,
    ) -> Result<Vec<Conversation>, RepoError> {
        let user_id = user_id.to_string();
        self.db
            .with_conn(move |conn| {
                query_list(
                    conn,
                    &format!(
                        "SELECT {COLUMNS} FROM conversations
                         WHERE user_id = ?1 AND is_active = 1 AND is_archived = 0
                         ORDER BY last_accessed_at ASC, updated_at ASC"
                    ),
                    params![user_id],
                )
            })
            .await
    }

    async fn list_active_idle_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Conversation>, RepoError> {
        let cutoff = ts(cutoff);
        self.db
            .with_conn(move |conn| {
                query_list(
                    conn,
                    &format!(
                        "SELECT {COLUMNS} FROM conversations
                         WHERE is_active = 1 AND is_archived = 0
                           AND COALESCE(last_accessed_at, updated_at) < ?1"
                    ),
                    params![cutoff],
                )
            })
            .await
    }

    async fn list_archived(&self, user_id: &str) -> Result<Vec<Conversation>, RepoError> {
        let user_id = user_id.to_string();
        self.db
            .with_conn(move |conn| {
                query_list(
                    conn,
                    &format!(
                        "SELECT {COLUMNS} FROM conversations
                         WHERE user_id = ?1 AND is_archived = 1
                         ORDER BY archived_at DESC"
                    ),
                    params![user_id],
                )
            })
            .await
    }

    async fn list_archived_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Conversation>, RepoError> {
        let cutoff = ts(cutoff);
        self.db
            .with_conn(move |conn| {
                query_list(
                    conn,
                    &format!(
                        "SELECT {COLUMNS} FROM conversations
                         WHERE is_archived = 1 AND archived_at < ?1"
                    ),
                    params![cutoff],
                )
            })
            .await
    }

    async fn set_archived(&self, id: &str, archived: bool) -> Result<(), RepoError> {
        let id = id.to_string();
        let now = ts(Utc::now());
        self.db
            .with_conn(move |conn| {
                if archived {
                    conn.execute(
                        "UPDATE conversations
                         SET is_active = 0, is_archived = 1, archived_at = ?1
                         WHERE id = ?2",
                        params![now, id],
                    )
                } else {
                    conn.execute(
                        "UPDATE conversations
                         SET is_active = 1, is_archived = 0, archived_at = NULL,
                             last_accessed_at = ?1
                         WHERE id = ?2",
                        params![now, id],
                    )
                }
                .map_err(storage)?;
                Ok(())
            })
            .await
    }

    async fn delete_hard(&self, id: &str) -> Result<(), RepoError> {
        let id = id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])
                    .map_err(storage)?;
                Ok(())
            })
            .await
    }

    async fn user_ids_with_conversations(&self) -> Result<Vec<String>, RepoError> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT DISTINCT user_id FROM conversations")
                    .map_err(storage)?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(storage)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(storage)?;
                Ok(ids)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::sqlite::test_db;

    async fn repo() -> (tempfile::TempDir, SqliteConversationRepo) {
        let (dir, db) = test_db();
        (dir, SqliteConversationRepo::new(db))
    }

    #[tokio::test]
    async fn save_find_and_ownership_check() {
        let (_dir, repo) = repo().await;
        let c = Conversation::new("u1", "hello");
        repo.save(&c).await.unwrap();
        assert!(repo.find_by_id(&c.id, "u1").await.unwrap().is_some());
        assert!(repo.find_by_id(&c.id, "u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_archived_and_deleted_orders_by_updated() {
        let (_dir, repo) = repo().await;
        let mut a = Conversation::new("u1", "a");
        a.updated_at = Utc::now() - chrono::Duration::minutes(2);
        let b = Conversation::new("u1", "b");
        let c = Conversation::new("u1", "c");
        repo.save(&a).await.unwrap();
        repo.save(&b).await.unwrap();
        repo.save(&c).await.unwrap();
        repo.set_archived(&b.id, true).await.unwrap();
        repo.soft_delete(&c.id, "u1").await.unwrap();

        let page = repo.find_by_user("u1", 10, 0).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, a.id);
    }

    #[tokio::test]
    async fn message_append_bumps_count_title_update_does_not() {
        let (_dir, repo) = repo().await;
        let c = Conversation::new("u1", "t");
        repo.save(&c).await.unwrap();
        repo.record_message_append(&c.id).await.unwrap();
        repo.update_title(&c.id, "u1", "renamed").await.unwrap();
        let got = repo.find_by_id(&c.id, "u1").await.unwrap().unwrap();
        assert_eq!(got.message_count, 1);
        assert_eq!(got.title, "renamed");
    }

    #[tokio::test]
    async fn archived_and_active_are_mutually_exclusive() {
        let (_dir, repo) = repo().await;
        let c = Conversation::new("u1", "t");
        repo.save(&c).await.unwrap();
        repo.set_archived(&c.id, true).await.unwrap();
        let got = repo.find_by_id(&c.id, "u1").await.unwrap().unwrap();
        assert!(!got.is_active && got.is_archived && got.archived_at.is_some());

        repo.set_archived(&c.id, false).await.unwrap();
        let got = repo.find_by_id(&c.id, "u1").await.unwrap().unwrap();
        assert!(got.is_active && !got.is_archived && got.archived_at.is_none());
    }

    #[tokio::test]
    async fn stalest_first_ordering() {
        let (_dir, repo) = repo().await;
        let mut old = Conversation::new("u1", "old");
        old.last_accessed_at = Utc::now() - chrono::Duration::days(3);
        let fresh = Conversation::new("u1", "fresh");
        repo.save(&fresh).await.unwrap();
        repo.save(&old).await.unwrap();
        let list = repo.list_active_stalest_first("u1").await.unwrap();
        assert_eq!(list[0].id, old.id);
    }
}
