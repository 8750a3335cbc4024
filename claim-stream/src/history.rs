use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, StreamError};

/// Storage key holding the serialized history list
pub const HISTORY_KEY: &str = "claim-history";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ClaimStatus::Processing => "processing",
            ClaimStatus::Completed => "completed",
            ClaimStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One submitted claim as remembered between runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimHistoryEntry {
    pub id: Uuid,
    #[serde(rename = "claimText")]
    pub text: String,
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
    pub status: ClaimStatus,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Trait for whole-value string storage under a key
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>>;
    async fn write(&self, key: &str, value: String) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory implementation of KeyValueStore
#[derive(Default)]
pub struct InMemoryStore {
    values: Arc<DashMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).map(|entry| entry.clone()))
    }

    async fn write(&self, key: &str, value: String) -> Result<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }
}

/// KeyValueStore keeping one `<key>.json` file per key in a directory
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StreamError::Storage(format!("Failed to read {key}: {e}"))),
        }
    }

    async fn write(&self, key: &str, value: String) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StreamError::Storage(format!("Failed to create {}: {e}", self.dir.display())))?;

        // write then rename so readers never see a half-written list
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| StreamError::Storage(format!("Failed to write {key}: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StreamError::Storage(format!("Failed to replace {key}: {e}")))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StreamError::Storage(format!("Failed to remove {key}: {e}"))),
        }
    }
}

/// Most-recent-first list of submitted claims.
///
/// Every mutation reads the full list, edits it and writes it back.
#[derive(Clone)]
pub struct ClaimHistory {
    store: Arc<dyn KeyValueStore>,
}

impl ClaimHistory {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    pub async fn list(&self) -> Result<Vec<ClaimHistoryEntry>> {
        match self.store.read(HISTORY_KEY).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<ClaimHistoryEntry>> {
        Ok(self.list().await?.into_iter().find(|e| e.id == id))
    }

    /// Record a new submission in `processing` state
    pub async fn create(&self, text: impl Into<String>) -> Result<ClaimHistoryEntry> {
        let entry = ClaimHistoryEntry {
            id: Uuid::new_v4(),
            text: text.into(),
            created_at: Utc::now(),
            status: ClaimStatus::Processing,
            summary: None,
        };
        let mut entries = self.list().await?;
        entries.insert(0, entry.clone());
        self.save(&entries).await?;
        debug!(entry_id = %entry.id, "Created history entry");
        Ok(entry)
    }

    pub async fn complete(&self, id: Uuid, summary: Option<String>) -> Result<ClaimHistoryEntry> {
        self.resolve(id, ClaimStatus::Completed, summary).await
    }

    pub async fn fail(&self, id: Uuid, summary: Option<String>) -> Result<ClaimHistoryEntry> {
        self.resolve(id, ClaimStatus::Failed, summary).await
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut entries = self.list().await?;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() != before;
        if removed {
            self.save(&entries).await?;
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<()> {
        self.save(&[]).await
    }

    /// Move an entry out of `processing`, exactly once
    async fn resolve(
        &self,
        id: Uuid,
        status: ClaimStatus,
        summary: Option<String>,
    ) -> Result<ClaimHistoryEntry> {
        let mut entries = self.list().await?;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StreamError::Storage(format!("History entry {id} not found")))?;

        if entry.status != ClaimStatus::Processing {
            return Err(StreamError::InvalidTransition {
                from: entry.status.to_string(),
                to: status.to_string(),
            });
        }
        entry.status = status;
        entry.summary = summary;
        let updated = entry.clone();

        self.save(&entries).await?;
        debug!(entry_id = %id, status = %status, "Resolved history entry");
        Ok(updated)
    }

    async fn save(&self, entries: &[ClaimHistoryEntry]) -> Result<()> {
        let raw = serde_json::to_string(entries)?;
        self.store.write(HISTORY_KEY, raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_most_recent_first() {
        let history = ClaimHistory::in_memory();
        let first = history.create("first claim").await.unwrap();
        let second = history.create("second claim").await.unwrap();

        let entries = history.list().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, second.id);
        assert_eq!(entries[1].id, first.id);
        assert!(entries.iter().all(|e| e.status == ClaimStatus::Processing));
    }

    #[tokio::test]
    async fn test_status_resolves_once() {
        let history = ClaimHistory::in_memory();
        let entry = history.create("claim").await.unwrap();

        let done = history
            .complete(entry.id, Some("APPROVED".to_string()))
            .await
            .unwrap();
        assert_eq!(done.status, ClaimStatus::Completed);
        assert_eq!(done.summary.as_deref(), Some("APPROVED"));

        let again = history.fail(entry.id, None).await;
        assert!(matches!(again, Err(StreamError::InvalidTransition { .. })));
        let stored = history.get(entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ClaimStatus::Completed);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let history = ClaimHistory::in_memory();
        let a = history.create("a").await.unwrap();
        history.create("b").await.unwrap();

        assert!(history.delete(a.id).await.unwrap());
        assert!(!history.delete(a.id).await.unwrap());
        assert_eq!(history.list().await.unwrap().len(), 1);

        history.clear().await.unwrap();
        assert!(history.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wire_format() {
        let store = Arc::new(InMemoryStore::new());
        let history = ClaimHistory::new(store.clone());
        history.create("Knee surgery").await.unwrap();

        let raw = store.read(HISTORY_KEY).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let entry = &value[0];
        assert_eq!(entry["claimText"], "Knee surgery");
        assert_eq!(entry["status"], "processing");
        assert!(entry["timestamp"].as_str().unwrap().contains('T'));
    }

    #[tokio::test]
    async fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let history = ClaimHistory::new(Arc::new(FileStore::new(dir.path())));
        let entry = history.create("persisted").await.unwrap();

        let reopened = ClaimHistory::new(Arc::new(FileStore::new(dir.path())));
        let entries = reopened.list().await.unwrap();
        assert_eq!(entries, vec![entry]);

        let store = FileStore::new(dir.path());
        store.remove(HISTORY_KEY).await.unwrap();
        assert!(store.read(HISTORY_KEY).await.unwrap().is_none());
        store.remove(HISTORY_KEY).await.unwrap();
    }
}
