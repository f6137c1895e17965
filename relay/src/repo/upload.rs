//! Chunked upload store: session bookkeeping plus hash-verified chunk files.
//!
//! The reference implementation keeps session records in memory and chunk
//! bytes on the filesystem under one directory per session. A chunk whose
//! sha256 does not match the client's claim is not persisted.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use super::RepoError;

/// One chunked upload in progress.
#[derive(Clone, Debug)]
pub struct UploadSession {
    pub id: String,
    pub total_chunks: u32,
    /// Verified hash per received chunk index.
    pub chunk_hashes: Vec<Option<String>>,
    pub received: BTreeSet<u32>,
    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(id: impl Into<String>, total_chunks: u32) -> Self {
        Self {
            id: id.into(),
            total_chunks,
            chunk_hashes: vec![None; total_chunks as usize],
            received: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    /// Complete ⇔ every index in `0..total_chunks` has been received.
    pub fn is_complete(&self) -> bool {
        self.received.len() as u32 == self.total_chunks
    }
}

/// Result of one chunk write.
#[derive(Clone, Debug)]
pub struct ChunkReceipt {
    pub verified: bool,
    pub error: Option<String>,
}

#[async_trait]
pub trait UploadStore: Send + Sync {
    async fn save_session(&self, session: &UploadSession) -> Result<(), RepoError>;
    async fn find_session(&self, id: &str) -> Result<Option<UploadSession>, RepoError>;
    /// Verifies and persists one chunk. A hash mismatch is reported, not
    /// stored, and is not an `Err`.
    async fn save_chunk(
        &self,
        session_id: &str,
        index: u32,
        data: &[u8],
        sha256: &str,
    ) -> Result<ChunkReceipt, RepoError>;
    async fn read_chunk(&self, session_id: &str, index: u32) -> Result<Vec<u8>, RepoError>;
    /// Concatenates all chunks in index order; fails while incomplete.
    async fn assemble(&self, session_id: &str) -> Result<Vec<u8>, RepoError>;
    async fn delete_session(&self, session_id: &str) -> Result<(), RepoError>;
    /// Removes sessions (and their chunks) older than `ttl`.
    async fn cleanup_expired(&self, ttl: Duration) -> Result<u64, RepoError>;
}

/// Filesystem-backed reference implementation.
pub struct FsUploadStore {
    root: PathBuf,
    sessions: DashMap<String, UploadSession>,
}

impl FsUploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sessions: DashMap::new(),
        }
    }

    fn chunk_path(&self, session_id: &str, index: u32) -> PathBuf {
        self.root.join(session_id).join(format!("{index}.bin"))
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }
}

fn hex_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl UploadStore for FsUploadStore {
    async fn save_session(&self, session: &UploadSession) -> Result<(), RepoError> {
        if session.total_chunks == 0 {
            return Err(RepoError::InvalidInput("total_chunks must be > 0".into()));
        }
        tokio::fs::create_dir_all(self.session_dir(&session.id))
            .await
            .map_err(|e| RepoError::Storage(e.to_string()))?;
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn find_session(&self, id: &str) -> Result<Option<UploadSession>, RepoError> {
        Ok(self.sessions.get(id).map(|s| s.clone()))
    }

    async fn save_chunk(
        &self,
        session_id: &str,
        index: u32,
        data: &[u8],
        sha256: &str,
    ) -> Result<ChunkReceipt, RepoError> {
        let Some(session) = self.sessions.get(session_id).map(|s| s.clone()) else {
            return Err(RepoError::NotFound);
        };
        if index >= session.total_chunks {
            return Err(RepoError::InvalidInput(format!(
                "chunk index {index} out of range (total {})",
                session.total_chunks
            )));
        }
        let actual = hex_digest(data);
        if !actual.eq_ignore_ascii_case(sha256) {
            return Ok(ChunkReceipt {
                verified: false,
                error: Some(format!(
                    "sha256 mismatch for chunk {index}: expected {sha256}, got {actual}"
                )),
            });
        }
        tokio::fs::write(self.chunk_path(session_id, index), data)
            .await
            .map_err(|e| RepoError::Storage(e.to_string()))?;
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.received.insert(index);
            entry.chunk_hashes[index as usize] = Some(actual);
        }
        Ok(ChunkReceipt {
            verified: true,
            error: None,
        })
    }

    async fn read_chunk(&self, session_id: &str, index: u32) -> Result<Vec<u8>, RepoError> {
        tokio::fs::read(self.chunk_path(session_id, index))
            .await
            .map_err(|_| RepoError::NotFound)
    }

    async fn assemble(&self, session_id: &str) -> Result<Vec<u8>, RepoError> {
        let session = self
            .sessions
            .get(session_id)
            .map(|s| s.clone())
            .ok_or(RepoError::NotFound)?;
        if !session.is_complete() {
            return Err(RepoError::InvalidInput(format!(
                "upload incomplete: {}/{} chunks",
                session.received.len(),
                session.total_chunks
            )));
        }
        let mut out = Vec::new();
        for index in 0..session.total_chunks {
            out.extend(self.read_chunk(session_id, index).await?);
        }
        Ok(out)
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), RepoError> {
        self.sessions.remove(session_id);
        let dir = self.session_dir(session_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(dir)
                .await
                .map_err(|e| RepoError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    async fn cleanup_expired(&self, ttl: Duration) -> Result<u64, RepoError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl)
                .map_err(|e| RepoError::InvalidInput(e.to_string()))?;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.created_at < cutoff)
            .map(|s| s.id.clone())
            .collect();
        for id in &expired {
            self.delete_session(id).await?;
        }
        Ok(expired.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsUploadStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsUploadStore::new(dir.path().to_path_buf());
        (dir, store)
    }

    #[tokio::test]
    async fn verified_chunks_assemble_in_order() {
        let (_dir, store) = store();
        store
            .save_session(&UploadSession::new("s1", 2))
            .await
            .unwrap();

        // Out-of-order arrival is fine.
        let second = b"world";
        let first = b"hello ";
        let r = store
            .save_chunk("s1", 1, second, &hex_digest(second))
            .await
            .unwrap();
        assert!(r.verified);
        assert!(!store.find_session("s1").await.unwrap().unwrap().is_complete());
        store
            .save_chunk("s1", 0, first, &hex_digest(first))
            .await
            .unwrap();

        let session = store.find_session("s1").await.unwrap().unwrap();
        assert!(session.is_complete());
        assert_eq!(store.assemble("s1").await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn hash_mismatch_is_reported_and_not_persisted() {
        let (_dir, store) = store();
        store
            .save_session(&UploadSession::new("s1", 1))
            .await
            .unwrap();
        let r = store
            .save_chunk("s1", 0, b"data", "deadbeef")
            .await
            .unwrap();
        assert!(!r.verified);
        assert!(r.error.unwrap().contains("mismatch"));
        assert!(store.read_chunk("s1", 0).await.is_err());
        assert!(!store.find_session("s1").await.unwrap().unwrap().is_complete());
    }

    #[tokio::test]
    async fn assemble_fails_while_incomplete() {
        let (_dir, store) = store();
        store
            .save_session(&UploadSession::new("s1", 2))
            .await
            .unwrap();
        let data = b"only one";
        store
            .save_chunk("s1", 0, data, &hex_digest(data))
            .await
            .unwrap();
        assert!(matches!(
            store.assemble("s1").await,
            Err(RepoError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_removes_old_sessions() {
        let (_dir, store) = store();
        let mut session = UploadSession::new("old", 1);
        session.created_at = Utc::now() - chrono::Duration::hours(2);
        store.save_session(&session).await.unwrap();
        store
            .save_session(&UploadSession::new("fresh", 1))
            .await
            .unwrap();

        let removed = store
            .cleanup_expired(Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.find_session("old").await.unwrap().is_none());
        assert!(store.find_session("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn out_of_range_index_is_invalid() {
        let (_dir, store) = store();
        store
            .save_session(&UploadSession::new("s1", 1))
            .await
            .unwrap();
        assert!(matches!(
            store.save_chunk("s1", 5, b"x", "00").await,
            Err(RepoError::InvalidInput(_))
        ));
    }
}
