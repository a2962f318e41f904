use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filing_core::{FilingError, LockRecord, RemoteProvider};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, instrument, warn};

use crate::storage::{normalize_file_path, LocalWorkingStore};

const LOCKS_DIR: &str = ".locks";

/// Lock file content.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockFile {
    user_id: String,
    reason: String,
    timestamp: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl LockFile {
    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    fn into_record(self) -> LockRecord {
        LockRecord {
            user_id: self.user_id,
            reason: self.reason,
            timestamp: self.timestamp,
        }
    }
}

/// A shared directory acting as the remote.
///
/// Objects mirror their relative paths; locks are JSON files with an expiry:
/// ```text
/// {root}/
///   docs/report.md
///   .locks/
///     {hex(path)}.lock    # { user_id, reason, timestamp, expires_at }
/// ```
/// Several providers (or processes) pointed at the same root share its
/// lock registry. An expired lock counts as released.
#[derive(Debug, Clone)]
pub struct DirectoryRemote {
    objects: LocalWorkingStore,
    lock_ttl: Duration,
}

impl DirectoryRemote {
    pub fn new(root: impl AsRef<Path>, lock_ttl: Duration) -> Self {
        Self {
            objects: LocalWorkingStore::new(root),
            lock_ttl,
        }
    }

    pub fn root(&self) -> &Path {
        self.objects.root()
    }

    fn locks_dir(&self) -> PathBuf {
        self.objects.root().join(LOCKS_DIR)
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", hex::encode(key)))
    }

    /// Load a live lock, deleting it if it has expired.
    async fn load_lock(&self, key: &str) -> Result<Option<LockFile>, FilingError> {
        let path = self.lock_path(key);
        let json = match fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(FilingError::Remote(format!(
                    "Failed to read lock file {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let lock: LockFile = serde_json::from_str(&json).map_err(|e| {
            FilingError::Serialization(format!("Failed to parse lock file {}: {}", path.display(), e))
        })?;

        if lock.is_expired() {
            debug!("Lock on {} held by {} expired", key, lock.user_id);
            if let Err(e) = fs::remove_file(&path).await {
                warn!("Failed to remove expired lock {}: {}", path.display(), e);
            }
            return Ok(None);
        }
        Ok(Some(lock))
    }

    async fn save_lock(&self, key: &str, lock: &LockFile) -> Result<(), FilingError> {
        let dir = self.locks_dir();
        fs::create_dir_all(&dir).await.map_err(|e| {
            FilingError::Remote(format!("Failed to create locks dir {}: {}", dir.display(), e))
        })?;

        let path = self.lock_path(key);
        let json = serde_json::to_string_pretty(lock)
            .map_err(|e| FilingError::Serialization(format!("Failed to serialize lock: {}", e)))?;

        // Write atomically via temp file
        let temp_path = path.with_extension("lock.tmp");
        fs::write(&temp_path, &json)
            .await
            .map_err(|e| FilingError::Remote(format!("Failed to write lock file: {}", e)))?;
        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| FilingError::Remote(format!("Failed to rename lock file: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl RemoteProvider for DirectoryRemote {
    fn backend_name(&self) -> &'static str {
        "directory"
    }

    #[instrument(skip(self, content), level = "debug", fields(content_len = content.len()))]
    async fn create(&self, path: &str, content: &[u8]) -> Result<(), FilingError> {
        self.objects.create(path, content).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn read(&self, path: &str) -> Result<Vec<u8>, FilingError> {
        self.objects.read(path).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, path: &str) -> Result<(), FilingError> {
        match self.objects.delete(path).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn list(&self, dir_path: &str) -> Result<Vec<String>, FilingError> {
        let entries = self.objects.list(dir_path).await?;
        Ok(entries
            .into_iter()
            .map(|e| e.name)
            .filter(|name| name != LOCKS_DIR)
            .collect())
    }

    fn supports_locking(&self) -> bool {
        true
    }

    #[instrument(skip(self), level = "debug")]
    async fn lock_file(&self, path: &str, user_id: &str, reason: &str) -> Result<(), FilingError> {
        let key = normalize_file_path(path)?;
        if let Some(existing) = self.load_lock(&key).await? {
            if existing.user_id != user_id {
                return Err(FilingError::LockConflict {
                    path: key,
                    holder: existing.user_id,
                });
            }
        }

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.lock_ttl)
            .map_err(|e| FilingError::InvalidArgument(format!("Lock TTL out of range: {}", e)))?;
        let lock = LockFile {
            user_id: user_id.to_string(),
            reason: reason.to_string(),
            timestamp: now,
            expires_at: now + ttl,
        };
        self.save_lock(&key, &lock).await?;
        debug!("Remote lock on {} for {}", key, user_id);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn unlock_file(&self, path: &str, user_id: &str) -> Result<(), FilingError> {
        let key = normalize_file_path(path)?;
        let Some(existing) = self.load_lock(&key).await? else {
            debug!("No remote lock on {} to release", key);
            return Ok(());
        };
        if existing.user_id != user_id {
            return Err(FilingError::Ownership(format!(
                "remote lock on {} belongs to {}, not {}",
                key, existing.user_id, user_id
            )));
        }

        let lock_path = self.lock_path(&key);
        match fs::remove_file(&lock_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(FilingError::Remote(format!(
                    "Failed to remove lock file {}: {}",
                    lock_path.display(),
                    e
                )))
            }
        }
        debug!("Remote unlock on {} by {}", key, user_id);
        Ok(())
    }

    async fn lock_holder(&self, path: &str) -> Result<Option<LockRecord>, FilingError> {
        let key = normalize_file_path(path)?;
        Ok(self.load_lock(&key).await?.map(LockFile::into_record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (DirectoryRemote, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let remote = DirectoryRemote::new(temp_dir.path(), Duration::from_secs(60));
        (remote, temp_dir)
    }

    #[tokio::test]
    async fn test_objects() {
        let (remote, _temp) = setup();
        assert!(remote.read("a.txt").await.unwrap_err().is_not_found());

        remote.create("dir/a.txt", b"hello").await.unwrap();
        assert_eq!(remote.read("dir/a.txt").await.unwrap(), b"hello");
        assert_eq!(remote.list("dir").await.unwrap(), vec!["a.txt"]);

        remote.delete("dir/a.txt").await.unwrap();
        remote.delete("dir/a.txt").await.unwrap();
        assert!(remote.list("dir").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_registry() {
        let (remote, _temp) = setup();
        remote.lock_file("a.txt", "alice", "editing").await.unwrap();
        assert_eq!(remote.lock_holder("a.txt").await.unwrap().unwrap().user_id, "alice");
        assert_eq!(remote.list("").await.unwrap(), Vec::<String>::new());

        let err = remote.lock_file("a.txt", "bob", "").await.unwrap_err();
        assert!(err.is_lock_conflict());
        let err = remote.unlock_file("a.txt", "bob").await.unwrap_err();
        assert!(matches!(err, FilingError::Ownership(_)));

        remote.unlock_file("a.txt", "alice").await.unwrap();
        assert!(remote.lock_holder("a.txt").await.unwrap().is_none());
        remote.lock_file("a.txt", "bob", "").await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lock_is_released() {
        let temp_dir = TempDir::new().unwrap();
        let remote = DirectoryRemote::new(temp_dir.path(), Duration::ZERO);
        remote.lock_file("a.txt", "alice", "").await.unwrap();
        assert!(remote.lock_holder("a.txt").await.unwrap().is_none());
        remote.lock_file("a.txt", "bob", "").await.unwrap();
    }
}
