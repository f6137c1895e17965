//! Multi-agent session state: round-by-round checkpoints with a TTL, so a
//! client that disconnects mid-workflow can resume where it left off.

pub mod workflow;

pub use workflow::{MultiAgentWorkflow, RoundSpec, WorkflowOutcome, WorkflowRequest};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::repo::RepoError;

pub const SESSION_TTL: Duration = Duration::from_secs(5 * 60);

/// Checkpoint of one multi-agent run, keyed by
/// `(conversation_id, user_id, assistant_message_id)`.
#[derive(Clone, Debug, Serialize)]
pub struct AgentSession {
    pub conversation_id: String,
    pub user_id: String,
    pub assistant_message_id: String,
    /// Rounds finished so far; only ever increases.
    pub completed_rounds: u32,
    /// Opaque workflow state, replaced wholesale on every checkpoint.
    pub session_state: serde_json::Value,
    pub user_query: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AgentSession {
    pub fn new(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        assistant_message_id: impl Into<String>,
        user_query: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            assistant_message_id: assistant_message_id.into(),
            completed_rounds: 0,
            session_state: serde_json::Value::Null,
            user_query: user_query.into(),
            created_at: now,
            updated_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::minutes(5)),
        }
    }

    fn key(&self) -> String {
        session_key(&self.conversation_id, &self.user_id, &self.assistant_message_id)
    }
}

fn session_key(conversation_id: &str, user_id: &str, assistant_message_id: &str) -> String {
    format!("{conversation_id}\u{1f}{user_id}\u{1f}{assistant_message_id}")
}

#[async_trait]
pub trait AgentSessionStore: Send + Sync {
    /// Idempotent upsert on the identifying tuple.
    async fn save(&self, session: &AgentSession) -> Result<(), RepoError>;
    /// Returns the session unless it has expired.
    async fn find_by_identifiers(
        &self,
        conversation_id: &str,
        user_id: &str,
        assistant_message_id: &str,
    ) -> Result<Option<AgentSession>, RepoError>;
    async fn delete(
        &self,
        conversation_id: &str,
        user_id: &str,
        assistant_message_id: &str,
    ) -> Result<(), RepoError>;
    /// Bulk-removes expired rows (for cold starts; reads also hide them).
    async fn clean_expired(&self) -> Result<u64, RepoError>;
}

/// Process-local reference implementation.
#[derive(Default)]
pub struct InMemoryAgentSessionStore {
    sessions: DashMap<String, AgentSession>,
}

impl InMemoryAgentSessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentSessionStore for InMemoryAgentSessionStore {
    async fn save(&self, session: &AgentSession) -> Result<(), RepoError> {
        self.sessions.insert(session.key(), session.clone());
        Ok(())
    }

    async fn find_by_identifiers(
        &self,
        conversation_id: &str,
        user_id: &str,
        assistant_message_id: &str,
    ) -> Result<Option<AgentSession>, RepoError> {
        let key = session_key(conversation_id, user_id, assistant_message_id);
        // Clone out of the map first so no shard guard is held across the
        // expiry removal.
        let session = self.sessions.get(&key).map(|s| s.clone());
        match session {
            Some(s) if s.expires_at > Utc::now() => Ok(Some(s)),
            Some(_) => {
                self.sessions.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(
        &self,
        conversation_id: &str,
        user_id: &str,
        assistant_message_id: &str,
    ) -> Result<(), RepoError> {
        self.sessions
            .remove(&session_key(conversation_id, user_id, assistant_message_id));
        Ok(())
    }

    async fn clean_expired(&self) -> Result<u64, RepoError> {
        let before = self.sessions.len();
        let now = Utc::now();
        self.sessions.retain(|_, s| s.expires_at > now);
        Ok((before - self.sessions.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(rounds: u32, ttl: Duration) -> AgentSession {
        let mut s = AgentSession::new("c1", "u1", "m1", "do the thing", ttl);
        s.completed_rounds = rounds;
        s
    }

    #[tokio::test]
    async fn save_is_idempotent_upsert() {
        let store = InMemoryAgentSessionStore::new();
        store.save(&session(1, SESSION_TTL)).await.unwrap();
        store.save(&session(2, SESSION_TTL)).await.unwrap();
        let got = store
            .find_by_identifiers("c1", "u1", "m1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.completed_rounds, 2);
    }

    #[tokio::test]
    async fn rounds_survive_reload_until_expiry() {
        let store = InMemoryAgentSessionStore::new();
        store.save(&session(3, SESSION_TTL)).await.unwrap();
        let got = store
            .find_by_identifiers("c1", "u1", "m1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.completed_rounds, 3);

        let mut expired = session(3, SESSION_TTL);
        expired.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store.save(&expired).await.unwrap();
        assert!(store
            .find_by_identifiers("c1", "u1", "m1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn clean_expired_reaps_in_bulk() {
        let store = InMemoryAgentSessionStore::new();
        let mut dead = session(1, SESSION_TTL);
        dead.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store.save(&dead).await.unwrap();
        let mut alive = AgentSession::new("c2", "u1", "m2", "q", SESSION_TTL);
        alive.completed_rounds = 1;
        store.save(&alive).await.unwrap();

        assert_eq!(store.clean_expired().await.unwrap(), 1);
        assert!(store
            .find_by_identifiers("c2", "u1", "m2")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn delete_is_by_tuple() {
        let store = InMemoryAgentSessionStore::new();
        store.save(&session(1, SESSION_TTL)).await.unwrap();
        store.delete("c1", "u1", "other").await.unwrap();
        assert!(store
            .find_by_identifiers("c1", "u1", "m1")
            .await
            .unwrap()
            .is_some());
        store.delete("c1", "u1", "m1").await.unwrap();
        assert!(store
            .find_by_identifiers("c1", "u1", "m1")
            .await
            .unwrap()
            .is_none());
    }
}
