//! Repository contracts the core depends on.
//!
//! Concrete stores are replaceable collaborators; this crate ships SQLite
//! reference implementations (conversations, messages, plans, users), an
//! in-memory store for the ephemeral TTL'd tables, and a filesystem store
//! for chunked uploads. Ownership is checked on every read and write: a
//! record is only visible to its owning user.

pub mod sqlite;
pub mod upload;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{ChatRole, Source, TokenUsage};

/// Errors from repository operations.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// One page of a list query.
#[derive(Clone, Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

/// A chat user; created lazily on first request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// One conversation. Valid states: active, archived, or soft-deleted
/// (neither flag set); never both flags at once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub is_active: bool,
    pub is_archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn new(user_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            title: title.into(),
            message_count: 0,
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            is_active: true,
            is_archived: false,
            archived_at: None,
        }
    }
}

/// One persisted message; immutable once saved. Assistant content may be
/// empty only when saved as a partial checkpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub role: ChatRole,
    pub content: String,
    pub thinking: Option<String>,
    pub sources: Vec<Source>,
    pub token_usage: Option<TokenUsage>,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    /// Client-supplied id for idempotent dedup.
    pub client_id: Option<String>,
}

impl StoredMessage {
    pub fn new(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        role: ChatRole,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            role,
            content: content.into(),
            thinking: None,
            sources: vec![],
            token_usage: None,
            duration_ms: None,
            created_at: Utc::now(),
            client_id: None,
        }
    }
}

/// Range read out of one large message, for lazy rendering.
#[derive(Clone, Debug, Serialize)]
pub struct ContentRange {
    pub content: String,
    pub start: usize,
    pub length: usize,
    pub total: usize,
    pub has_more: bool,
}

/// One task inside a plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanTask {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_hours: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// A user's plan; soft-deleted via `is_active`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub goal: String,
    pub tasks: Vec<PlanTask>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Partial update; at least one field must be set.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PlanUpdate {
    pub title: Option<String>,
    pub goal: Option<String>,
    pub tasks: Option<Vec<PlanTask>>,
}

impl PlanUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.goal.is_none() && self.tasks.is_none()
    }
}

#[async_trait]
pub trait UserRepo: Send + Sync {
    /// Returns the user, creating it on first sight; bumps `last_active_at`.
    async fn get_or_create(&self, id: &str, display_name: Option<&str>) -> Result<User, RepoError>;
    async fn find_by_id(&self, id: &str) -> Result<Option<User>, RepoError>;
}

#[async_trait]
pub trait ConversationRepo: Send + Sync {
    async fn save(&self, conversation: &Conversation) -> Result<(), RepoError>;
    async fn find_by_id(&self, id: &str, user_id: &str) -> Result<Option<Conversation>, RepoError>;
    /// Active, unarchived conversations, newest `updated_at` first.
    async fn find_by_user(
        &self,
        user_id: &str,
        limit: u32,
        skip: u32,
    ) -> Result<Page<Conversation>, RepoError>;
    async fn update_title(&self, id: &str, user_id: &str, title: &str) -> Result<(), RepoError>;
    /// Bumps `last_accessed_at` (and nothing else).
    async fn touch(&self, id: &str, user_id: &str) -> Result<(), RepoError>;
    /// Bumps `message_count` and `updated_at` on message append.
    async fn record_message_append(&self, id: &str) -> Result<(), RepoError>;
    /// Soft delete: clears both flags.
    async fn soft_delete(&self, id: &str, user_id: &str) -> Result<(), RepoError>;

    // Archival surface, used by the LRU scheduler.
    async fn count_active(&self, user_id: &str) -> Result<u64, RepoError>;
    /// Active conversations, stalest first (`last_accessed_at`, then `updated_at`).
    async fn list_active_stalest_first(&self, user_id: &str) -> Result<Vec<Conversation>, RepoError>;
    /// Active conversations (any user) untouched since `cutoff`.
    async fn list_active_idle_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Conversation>, RepoError>;
    /// Archived conversations for a user, newest archive first.
    async fn list_archived(&self, user_id: &str) -> Result<Vec<Conversation>, RepoError>;
    /// Archived conversations (any user) archived before `cutoff`.
    async fn list_archived_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Conversation>, RepoError>;
    async fn set_archived(&self, id: &str, archived: bool) -> Result<(), RepoError>;
    /// Physical delete of the row (messages are deleted by the caller).
    async fn delete_hard(&self, id: &str) -> Result<(), RepoError>;
    async fn user_ids_with_conversations(&self) -> Result<Vec<String>, RepoError>;
}

#[async_trait]
pub trait MessageRepo: Send + Sync {
    /// Persists one message. A duplicate `client_id` within the conversation
    /// is a no-op returning the already-stored message id.
    async fn save(&self, message: &StoredMessage) -> Result<String, RepoError>;
    async fn find_by_id(&self, id: &str, user_id: &str)
        -> Result<Option<StoredMessage>, RepoError>;
    /// Messages of one conversation, oldest first.
    async fn find_by_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
        limit: u32,
        skip: u32,
    ) -> Result<Page<StoredMessage>, RepoError>;
    /// Character-range read of one message's content.
    async fn content_range(
        &self,
        id: &str,
        user_id: &str,
        start: usize,
        len: usize,
    ) -> Result<ContentRange, RepoError>;
    async fn delete_by_conversation(&self, conversation_id: &str) -> Result<u64, RepoError>;
}

#[async_trait]
pub trait PlanRepo: Send + Sync {
    /// Creates a plan; the task list must be non-empty.
    async fn create(&self, plan: &Plan) -> Result<(), RepoError>;
    async fn find_by_id(&self, id: &str, user_id: &str) -> Result<Option<Plan>, RepoError>;
    /// Active plans, newest `updated_at` first.
    async fn list_by_user(
        &self,
        user_id: &str,
        limit: u32,
        skip: u32,
    ) -> Result<Page<Plan>, RepoError>;
    /// Applies a non-empty partial update and bumps `updated_at`.
    async fn update(&self, id: &str, user_id: &str, update: PlanUpdate) -> Result<Plan, RepoError>;
    async fn soft_delete(&self, id: &str, user_id: &str) -> Result<(), RepoError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_conversation_is_active_and_unarchived() {
        let c = Conversation::new("u1", "hello");
        assert!(c.is_active && !c.is_archived);
        assert_eq!(c.message_count, 0);
    }

    #[test]
    fn plan_update_emptiness() {
        assert!(PlanUpdate::default().is_empty());
        assert!(!PlanUpdate {
            title: Some("t".into()),
            ..PlanUpdate::default()
        }
        .is_empty());
    }
}
