//! SQLite-backed message repository.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};

use super::{parse_ts, storage, ts, SqliteDb};
use crate::repo::{ContentRange, MessageRepo, Page, RepoError, StoredMessage};

pub struct SqliteMessageRepo {
    db: SqliteDb,
}

impl SqliteMessageRepo {
    pub fn new(db: SqliteDb) -> Self {
        Self { db }
    }
}

const COLUMNS: &str = "id, conversation_id, user_id, role, content, thinking, sources, \
                       token_usage, duration_ms, created_at, client_id";

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role: String = row.get(3)?;
    let sources: String = row.get(6)?;
    let token_usage: Option<String> = row.get(7)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        user_id: row.get(2)?,
        role: role.parse().unwrap_or(crate::message::ChatRole::User),
        content: row.get(4)?,
        thinking: row.get(5)?,
        sources: serde_json::from_str(&sources).unwrap_or_default(),
        token_usage: token_usage.and_then(|s| serde_json::from_str(&s).ok()),
        duration_ms: row.get::<_, Option<i64>>(8)?.map(|n| n as u64),
        created_at: parse_ts(&row.get::<_, String>(9)?),
        client_id: row.get(10)?,
    })
}

#[async_trait]
impl MessageRepo for SqliteMessageRepo {
    async fn save(&self, message: &StoredMessage) -> Result<String, RepoError> {
        let m = message.clone();
        self.db
            .with_conn(move |conn| {
                if let Some(client_id) = &m.client_id {
                    let existing: Option<String> = conn
                        .query_row(
                            "SELECT id FROM messages WHERE conversation_id = ?1 AND client_id = ?2",
                            params![m.conversation_id, client_id],
                            |row| row.get(0),
                        )
                        .optional()
                        .map_err(storage)?;
                    if let Some(id) = existing {
                        return Ok(id);
                    }
                }
                let sources =
                    serde_json::to_string(&m.sources).map_err(|e| RepoError::Storage(e.to_string()))?;
                let token_usage = m
                    .token_usage
                    .map(|u| serde_json::to_string(&u))
                    .transpose()
                    .map_err(|e| RepoError::Storage(e.to_string()))?;
                conn.execute(
                    r#"
                    INSERT INTO messages
                        (id, conversation_id, user_id, role, content, thinking, sources,
                         token_usage, duration_ms, created_at, client_id)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                    "#,
                    params![
                        m.id,
                        m.conversation_id,
                        m.user_id,
                        m.role.as_str(),
                        m.content,
                        m.thinking,
                        sources,
                        token_usage,
                        m.duration_ms.map(|n| n as i64),
                        ts(m.created_at),
                        m.client_id,
                    ],
                )
                .map_err(storage)?;
                Ok(m.id)
            })
            .await
    }

    async fn find_by_id(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<Option<StoredMessage>, RepoError> {
        let (id, user_id) = (id.to_string(), user_id.to_string());
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    &format!("SELECT {COLUMNS} FROM messages WHERE id = ?1 AND user_id = ?2"),
                    params![id, user_id],
                    row_to_message,
                )
                .optional()
                .map_err(storage)
            })
            .await
    }

    async fn find_by_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
        limit: u32,
        skip: u32,
    ) -> Result<Page<StoredMessage>, RepoError> {
        let (conversation_id, user_id) = (conversation_id.to_string(), user_id.to_string());
        self.db
            .with_conn(move |conn| {
                let total: u64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM messages
                         WHERE conversation_id = ?1 AND user_id = ?2",
                        params![conversation_id, user_id],
                        |row| row.get::<_, i64>(0),
                    )
                    .map_err(storage)? as u64;
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {COLUMNS} FROM messages
                         WHERE conversation_id = ?1 AND user_id = ?2
                         ORDER BY created_at ASC LIMIT ?3 OFFSET ?4"
                    ))
                    .map_err(storage)?;
                let items = stmt
                    .query_map(
                        params![conversation_id, user_id, limit as i64, skip as i64],
                        row_to_message,
                    )
                    .map_err(storage)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(storage)?;
                Ok(Page { items, total })
            })
            .await
    }

    async fn content_range(
        &self,
        id: &str,
        user_id: &str,
        start: usize,
        len: usize,
    ) -> Result<ContentRange, RepoError> {
        let (id, user_id) = (id.to_string(), user_id.to_string());
        self.db
            .with_conn(move |conn| {
                let content: Option<String> = conn
                    .query_row(
                        "SELECT content FROM messages WHERE id = ?1 AND user_id = ?2",
                        params![id, user_id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(storage)?;
                let content = content.ok_or(RepoError::NotFound)?;
                // Char-indexed, not byte-indexed: content may be CJK-heavy.
                let total = content.chars().count();
                let slice: String = content.chars().skip(start).take(len).collect();
                let length = slice.chars().count();
                Ok(ContentRange {
                    content: slice,
                    start,
                    length,
                    total,
                    has_more: start + length < total,
                })
            })
            .await
    }

    async fn delete_by_conversation(&self, conversation_id: &str) -> Result<u64, RepoError> {
        let conversation_id = conversation_id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM messages WHERE conversation_id = ?1",
                    params![conversation_id],
                )
                .map(|n| n as u64)
                .map_err(storage)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChatRole, Source};
    use crate::repo::sqlite::test_db;

    async fn repo() -> (tempfile::TempDir, SqliteMessageRepo) {
        let (dir, db) = test_db();
        (dir, SqliteMessageRepo::new(db))
    }

    #[tokio::test]
    async fn round_trip_preserves_thinking_and_sources() {
        let (_dir, repo) = repo().await;
        let mut m = StoredMessage::new("c1", "u1", ChatRole::Assistant, "the answer");
        m.thinking = Some("let me think".into());
        m.sources = vec![Source {
            title: "Doc".into(),
            url: "https://example.com".into(),
        }];
        repo.save(&m).await.unwrap();

        let page = repo.find_by_conversation("c1", "u1", 10, 0).await.unwrap();
        assert_eq!(page.total, 1);
        let got = &page.items[0];
        assert_eq!(got.content, "the answer");
        assert_eq!(got.thinking.as_deref(), Some("let me think"));
        assert_eq!(got.sources, m.sources);
    }

    #[tokio::test]
    async fn client_id_dedup_returns_existing_id() {
        let (_dir, repo) = repo().await;
        let mut m1 = StoredMessage::new("c1", "u1", ChatRole::User, "hi");
        m1.client_id = Some("client-1".into());
        let stored = repo.save(&m1).await.unwrap();

        let mut m2 = StoredMessage::new("c1", "u1", ChatRole::User, "hi again");
        m2.client_id = Some("client-1".into());
        let deduped = repo.save(&m2).await.unwrap();
        assert_eq!(stored, deduped);
        assert_eq!(
            repo.find_by_conversation("c1", "u1", 10, 0).await.unwrap().total,
            1
        );
    }

    #[tokio::test]
    async fn ordering_is_timestamp_ascending() {
        let (_dir, repo) = repo().await;
        let mut first = StoredMessage::new("c1", "u1", ChatRole::User, "first");
        first.created_at = chrono::Utc::now() - chrono::Duration::seconds(5);
        let second = StoredMessage::new("c1", "u1", ChatRole::Assistant, "second");
        repo.save(&second).await.unwrap();
        repo.save(&first).await.unwrap();
        let page = repo.find_by_conversation("c1", "u1", 10, 0).await.unwrap();
        assert_eq!(page.items[0].content, "first");
        assert_eq!(page.items[1].content, "second");
    }

    #[tokio::test]
    async fn content_range_is_char_indexed() {
        let (_dir, repo) = repo().await;
        let m = StoredMessage::new("c1", "u1", ChatRole::Assistant, "你好世界abcd");
        repo.save(&m).await.unwrap();
        let range = repo.content_range(&m.id, "u1", 2, 4).await.unwrap();
        assert_eq!(range.content, "世界ab");
        assert_eq!(range.total, 8);
        assert!(range.has_more);
        let tail = repo.content_range(&m.id, "u1", 6, 10).await.unwrap();
        assert_eq!(tail.content, "cd");
        assert!(!tail.has_more);
    }

    #[tokio::test]
    async fn ownership_is_enforced() {
        let (_dir, repo) = repo().await;
        let m = StoredMessage::new("c1", "u1", ChatRole::User, "private");
        repo.save(&m).await.unwrap();
        assert!(repo.find_by_id(&m.id, "u2").await.unwrap().is_none());
        assert!(matches!(
            repo.content_range(&m.id, "u2", 0, 10).await,
            Err(RepoError::NotFound)
        ));
    }
}
