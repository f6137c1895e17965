//! Durable partial-output checkpoints, keyed by assistant message id.
//!
//! While a response streams, the handler upserts the accumulated text here
//! (roughly every second or hundred characters); a client that lost the
//! stream can poll the checkpoint and recover. Records expire 30 minutes
//! after their last update.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::message::Source;
use crate::repo::RepoError;

pub const PROGRESS_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Streaming,
    Completed,
    Error,
}

/// One checkpoint row.
#[derive(Clone, Debug, Serialize)]
pub struct StreamProgress {
    pub message_id: String,
    pub accumulated_text: String,
    pub thinking: Option<String>,
    pub sources: Vec<Source>,
    pub status: ProgressStatus,
    pub error: Option<String>,
    pub last_sent_position: usize,
    pub created_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
}

#[async_trait]
pub trait StreamProgressStore: Send + Sync {
    /// Creates (status `streaming`, position 0) or patches the checkpoint.
    async fn upsert(
        &self,
        message_id: &str,
        text: &str,
        thinking: Option<&str>,
        sources: &[Source],
    ) -> Result<(), RepoError>;
    async fn mark_completed(
        &self,
        message_id: &str,
        final_text: &str,
        thinking: Option<&str>,
        sources: &[Source],
    ) -> Result<(), RepoError>;
    async fn mark_error(&self, message_id: &str, error: &str) -> Result<(), RepoError>;
    async fn get(&self, message_id: &str) -> Result<Option<StreamProgress>, RepoError>;
    async fn delete(&self, message_id: &str) -> Result<(), RepoError>;
    /// Reaps records whose last update is older than the TTL.
    async fn clean_expired(&self) -> Result<u64, RepoError>;
}

/// Process-local reference implementation with lazy TTL reaping.
pub struct InMemoryProgressStore {
    records: DashMap<String, StreamProgress>,
    ttl: Duration,
}

impl Default for InMemoryProgressStore {
    fn default() -> Self {
        Self::new(PROGRESS_TTL)
    }
}

impl InMemoryProgressStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
        }
    }

    fn expired(&self, record: &StreamProgress) -> bool {
        Utc::now() - record.last_update_at
            > chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::minutes(30))
    }
}

#[async_trait]
impl StreamProgressStore for InMemoryProgressStore {
    async fn upsert(
        &self,
        message_id: &str,
        text: &str,
        thinking: Option<&str>,
        sources: &[Source],
    ) -> Result<(), RepoError> {
        let now = Utc::now();
        self.records
            .entry(message_id.to_string())
            .and_modify(|r| {
                r.accumulated_text = text.to_string();
                r.thinking = thinking.map(str::to_string);
                r.sources = sources.to_vec();
                r.last_update_at = now;
            })
            .or_insert_with(|| StreamProgress {
                message_id: message_id.to_string(),
                accumulated_text: text.to_string(),
                thinking: thinking.map(str::to_string),
                sources: sources.to_vec(),
                status: ProgressStatus::Streaming,
                error: None,
                last_sent_position: 0,
                created_at: now,
                last_update_at: now,
            });
        Ok(())
    }

    async fn mark_completed(
        &self,
        message_id: &str,
        final_text: &str,
        thinking: Option<&str>,
        sources: &[Source],
    ) -> Result<(), RepoError> {
        self.upsert(message_id, final_text, thinking, sources).await?;
        if let Some(mut r) = self.records.get_mut(message_id) {
            r.status = ProgressStatus::Completed;
        }
        Ok(())
    }

    async fn mark_error(&self, message_id: &str, error: &str) -> Result<(), RepoError> {
        let now = Utc::now();
        self.records
            .entry(message_id.to_string())
            .and_modify(|r| {
                r.status = ProgressStatus::Error;
                r.error = Some(error.to_string());
                r.last_update_at = now;
            })
            .or_insert_with(|| StreamProgress {
                message_id: message_id.to_string(),
                accumulated_text: String::new(),
                thinking: None,
                sources: vec![],
                status: ProgressStatus::Error,
                error: Some(error.to_string()),
                last_sent_position: 0,
                created_at: now,
                last_update_at: now,
            });
        Ok(())
    }

    async fn get(&self, message_id: &str) -> Result<Option<StreamProgress>, RepoError> {
        match self.records.get(message_id) {
            Some(r) if !self.expired(&r) => Ok(Some(r.clone())),
            Some(r) => {
                let id = r.message_id.clone();
                drop(r);
                self.records.remove(&id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, message_id: &str) -> Result<(), RepoError> {
        self.records.remove(message_id);
        Ok(())
    }

    async fn clean_expired(&self) -> Result<u64, RepoError> {
        let before = self.records.len();
        self.records.retain(|_, r| {
            Utc::now() - r.last_update_at
                <= chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::minutes(30))
        });
        Ok((before - self.records.len()) as u64)
    }
}
