//! Durable per-path state machine and lock registry.
//!
//! The whole document lives in memory and is rewritten on every mutation:
//! ```text
//! {metadata_dir}/
//!   metadata.json     # { "<path>": FileRecord, ... }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use filing_core::{
    FileRecord, FileState, FilingError, LockAcquireResult, LockManager, LockRecord,
    LockReleaseResult, SyncStatus,
};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

const METADATA_FILE: &str = "metadata.json";

type Records = BTreeMap<String, FileRecord>;

/// Metadata store keyed by normalized relative path.
///
/// Ownership of a lock is derived at query time by comparing the lock's
/// `user_id` with this store's identity.
#[derive(Debug)]
pub struct MetadataStore {
    metadata_dir: PathBuf,
    user_id: String,
    records: Mutex<Records>,
    initialized: AtomicBool,
}

impl MetadataStore {
    /// Create a new MetadataStore for `user_id` persisting under `metadata_dir`.
    pub fn new(metadata_dir: impl AsRef<Path>, user_id: impl Into<String>) -> Self {
        Self {
            metadata_dir: metadata_dir.as_ref().to_path_buf(),
            user_id: user_id.into(),
            records: Mutex::new(BTreeMap::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// The identity lock ownership is compared against.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn metadata_path(&self) -> PathBuf {
        self.metadata_dir.join(METADATA_FILE)
    }

    /// Load the document into memory, creating the directory if absent.
    #[instrument(skip(self), level = "debug", fields(dir = %self.metadata_dir.display()))]
    pub async fn initialize(&self) -> Result<(), FilingError> {
        fs::create_dir_all(&self.metadata_dir).await.map_err(|e| {
            FilingError::Persistence(format!(
                "Failed to create metadata dir {}: {}",
                self.metadata_dir.display(),
                e
            ))
        })?;

        let path = self.metadata_path();
        let loaded: Records = match fs::read_to_string(&path).await {
            Ok(json) => serde_json::from_str(&json).map_err(|e| {
                FilingError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(FilingError::Persistence(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let mut records = self.records.lock().await;
        *records = loaded;
        self.initialized.store(true, Ordering::SeqCst);
        info!("Loaded metadata for {} paths", records.len());
        Ok(())
    }

    /// Rewrite the whole document (temp file + rename).
    async fn persist(&self, records: &Records) -> Result<(), FilingError> {
        let path = self.metadata_path();
        let json = serde_json::to_string_pretty(records).map_err(|e| {
            FilingError::Serialization(format!("Failed to serialize metadata: {}", e))
        })?;

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &json).await.map_err(|e| {
            FilingError::Persistence(format!("Failed to write metadata: {}", e))
        })?;
        fs::rename(&temp_path, &path).await.map_err(|e| {
            FilingError::Persistence(format!("Failed to rename metadata: {}", e))
        })?;

        debug!("Saved metadata with {} paths", records.len());
        Ok(())
    }

    /// Apply `f` to the record slot for `path` and persist.
    ///
    /// The in-memory change is rolled back when `f` or the write fails.
    async fn mutate<T>(
        &self,
        path: &str,
        f: impl FnOnce(&mut Option<FileRecord>) -> Result<T, FilingError>,
    ) -> Result<T, FilingError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(FilingError::NotInitialized(
                "metadata store has not been loaded".to_string(),
            ));
        }

        let mut records = self.records.lock().await;
        let previous = records.get(path).cloned();
        let mut slot = previous.clone();
        let out = f(&mut slot)?;

        match slot {
            Some(record) => {
                records.insert(path.to_string(), record);
            }
            None => {
                records.remove(path);
            }
        }

        if let Err(e) = self.persist(&records).await {
            match previous {
                Some(record) => {
                    records.insert(path.to_string(), record);
                }
                None => {
                    records.remove(path);
                }
            }
            return Err(e);
        }
        Ok(out)
    }

    fn state_for_lock(&self, lock: &LockRecord) -> FileState {
        if lock.user_id == self.user_id {
            FileState::LockedLocal
        } else {
            FileState::LockedRemote
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// State of `path`; untouched paths are drafts.
    pub async fn get_file_state(&self, path: &str) -> FileState {
        self.records
            .lock()
            .await
            .get(path)
            .map(|r| r.state)
            .unwrap_or_default()
    }

    pub async fn get_record(&self, path: &str) -> Option<FileRecord> {
        self.records.lock().await.get(path).cloned()
    }

    pub async fn all_records(&self) -> Vec<FileRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    pub async fn lock_holder(&self, path: &str) -> Option<LockRecord> {
        self.records
            .lock()
            .await
            .get(path)
            .and_then(|r| r.lock.clone())
    }

    pub async fn is_locked_by_current_user(&self, path: &str) -> bool {
        self.lock_holder(path)
            .await
            .is_some_and(|lock| lock.user_id == self.user_id)
    }

    pub async fn is_locked_by_other_user(&self, path: &str) -> bool {
        self.lock_holder(path)
            .await
            .is_some_and(|lock| lock.user_id != self.user_id)
    }

    /// Known paths grouped by state.
    pub async fn get_sync_status(&self) -> SyncStatus {
        let records = self.records.lock().await;
        let mut status = SyncStatus::default();
        for (path, record) in records.iter() {
            status.push(record.state, path.clone());
        }
        status
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    pub async fn set_file_state(&self, path: &str, state: FileState) -> Result<(), FilingError> {
        self.mutate(path, |slot| {
            let record = slot.get_or_insert_with(|| FileRecord::new(path));
            record.state = state;
            record.touch();
            Ok(())
        })
        .await
    }

    /// Record a successful push or pull.
    ///
    /// The state becomes `Clean` unless the path is locked, in which case it
    /// keeps the lock-derived state.
    #[instrument(skip(self), level = "debug")]
    pub async fn mark_synced(&self, path: &str, remote_timestamp: &str) -> Result<(), FilingError> {
        let user_id = self.user_id.clone();
        self.mutate(path, |slot| {
            let record = slot.get_or_insert_with(|| FileRecord::new(path));
            record.remote_timestamp = Some(remote_timestamp.to_string());
            record.state = match &record.lock {
                Some(lock) if lock.user_id == user_id => FileState::LockedLocal,
                Some(_) => FileState::LockedRemote,
                None => FileState::Clean,
            };
            record.touch();
            Ok(())
        })
        .await
    }

    /// Lock `path` for `user_id`.
    ///
    /// Fails with `LockConflict` when someone else already holds it.
    #[instrument(skip(self), level = "debug")]
    pub async fn lock_file(
        &self,
        path: &str,
        user_id: &str,
        reason: &str,
    ) -> Result<(), FilingError> {
        let lock = LockRecord::new(user_id, reason);
        let state = self.state_for_lock(&lock);
        self.mutate(path, |slot| {
            let record = slot.get_or_insert_with(|| FileRecord::new(path));
            if let Some(existing) = &record.lock {
                if existing.user_id != user_id {
                    return Err(FilingError::LockConflict {
                        path: path.to_string(),
                        holder: existing.user_id.clone(),
                    });
                }
            }
            record.lock = Some(lock);
            record.state = state;
            record.touch();
            Ok(())
        })
        .await?;
        debug!("Locked {} for {} ({})", path, user_id, state);
        Ok(())
    }

    /// Release the lock on `path`; only its owner may do so.
    #[instrument(skip(self), level = "debug")]
    pub async fn unlock_file(&self, path: &str, user_id: &str) -> Result<(), FilingError> {
        self.mutate(path, |slot| {
            let record = slot.as_mut().ok_or_else(|| {
                FilingError::Ownership(format!("{} is not locked", path))
            })?;
            let holder = record
                .lock
                .as_ref()
                .map(|lock| lock.user_id.clone())
                .ok_or_else(|| FilingError::Ownership(format!("{} is not locked", path)))?;
            if holder != user_id {
                return Err(FilingError::Ownership(format!(
                    "{} is locked by {}, not {}",
                    path, holder, user_id
                )));
            }
            record.lock = None;
            record.state = FileState::Clean;
            record.touch();
            Ok(())
        })
        .await?;
        debug!("Unlocked {} by {}", path, user_id);
        Ok(())
    }

    /// Drop a lock held by another user (the remote stopped reporting it).
    ///
    /// Returns whether a lock was cleared.
    pub async fn clear_foreign_lock(&self, path: &str) -> Result<bool, FilingError> {
        let user_id = self.user_id.clone();
        self.mutate(path, |slot| {
            let Some(record) = slot.as_mut() else {
                return Ok(false);
            };
            let foreign = record
                .lock
                .as_ref()
                .is_some_and(|lock| lock.user_id != user_id);
            if foreign {
                record.lock = None;
                record.state = FileState::Clean;
                record.touch();
            }
            Ok(foreign)
        })
        .await
    }

    /// Remove the record for a deleted file. Returns whether one existed.
    pub async fn remove_record(&self, path: &str) -> Result<bool, FilingError> {
        self.mutate(path, |slot| Ok(slot.take().is_some())).await
    }
}

#[async_trait]
impl LockManager for MetadataStore {
    fn lock_type(&self) -> &'static str {
        "metadata"
    }

    async fn acquire(
        &self,
        path: &str,
        holder_id: &str,
        reason: &str,
    ) -> Result<LockAcquireResult, FilingError> {
        match self.lock_file(path, holder_id, reason).await {
            Ok(()) => Ok(LockAcquireResult::acquired()),
            Err(FilingError::LockConflict { holder, .. }) => Ok(LockAcquireResult::held_by(holder)),
            Err(e) => Err(e),
        }
    }

    async fn release(
        &self,
        path: &str,
        holder_id: &str,
    ) -> Result<LockReleaseResult, FilingError> {
        let reason = match self.lock_holder(path).await {
            None => "not_found",
            Some(lock) if lock.user_id != holder_id => "not_owner",
            Some(_) => {
                self.unlock_file(path, holder_id).await?;
                "ok"
            }
        };
        Ok(LockReleaseResult {
            released: reason == "ok",
            reason: reason.to_string(),
        })
    }

    async fn holder(&self, path: &str) -> Result<Option<LockRecord>, FilingError> {
        Ok(self.lock_holder(path).await)
    }

    async fn locked_paths(&self) -> Result<Vec<String>, FilingError> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|(_, r)| r.lock.is_some())
            .map(|(path, _)| path.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup(user: &str) -> (MetadataStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = MetadataStore::new(temp_dir.path().join("meta"), user);
        store.initialize().await.unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_untouched_path_is_draft() {
        let (store, _temp) = setup("alice").await;
        assert_eq!(store.get_file_state("never/seen.txt").await, FileState::Draft);
        assert!(store.get_record("never/seen.txt").await.is_none());
    }

    #[tokio::test]
    async fn test_lock_ownership_predicates() {
        let temp_dir = TempDir::new().unwrap();
        let alice = MetadataStore::new(temp_dir.path(), "alice");
        alice.initialize().await.unwrap();

        alice.lock_file("p.txt", "alice", "editing").await.unwrap();
        assert!(alice.is_locked_by_current_user("p.txt").await);
        assert!(!alice.is_locked_by_other_user("p.txt").await);
        assert_eq!(alice.get_file_state("p.txt").await, FileState::LockedLocal);

        // Same document, queried as somebody else
        let bob = MetadataStore::new(temp_dir.path(), "bob");
        bob.initialize().await.unwrap();
        assert!(bob.is_locked_by_other_user("p.txt").await);
        assert!(!bob.is_locked_by_current_user("p.txt").await);
    }

    #[tokio::test]
    async fn test_lock_for_other_user_is_locked_remote() {
        let (store, _temp) = setup("alice").await;
        store.lock_file("p.txt", "bob", "").await.unwrap();
        assert_eq!(store.get_file_state("p.txt").await, FileState::LockedRemote);

        let err = store.lock_file("p.txt", "alice", "").await.unwrap_err();
        assert!(matches!(err, FilingError::LockConflict { ref holder, .. } if holder == "bob"));
    }

    #[tokio::test]
    async fn test_unlock_ownership() {
        let (store, _temp) = setup("alice").await;
        store.lock_file("p.txt", "alice", "").await.unwrap();

        let err = store.unlock_file("p.txt", "mallory").await.unwrap_err();
        assert!(matches!(err, FilingError::Ownership(_)));
        assert!(store.is_locked_by_current_user("p.txt").await);

        store.unlock_file("p.txt", "alice").await.unwrap();
        assert_eq!(store.get_file_state("p.txt").await, FileState::Clean);
        assert!(store.lock_holder("p.txt").await.is_none());

        let err = store.unlock_file("p.txt", "alice").await.unwrap_err();
        assert!(matches!(err, FilingError::Ownership(_)));
    }

    #[tokio::test]
    async fn test_state_persists_across_reload() {
        let temp_dir = TempDir::new().unwrap();
        let store = MetadataStore::new(temp_dir.path(), "alice");
        store.initialize().await.unwrap();
        store.set_file_state("a.txt", FileState::Modified).await.unwrap();
        store.mark_synced("b.txt", "2024-01-01T00:00:00Z").await.unwrap();

        let reloaded = MetadataStore::new(temp_dir.path(), "alice");
        reloaded.initialize().await.unwrap();
        assert_eq!(reloaded.get_file_state("a.txt").await, FileState::Modified);
        let b = reloaded.get_record("b.txt").await.unwrap();
        assert_eq!(b.state, FileState::Clean);
        assert_eq!(b.remote_timestamp.as_deref(), Some("2024-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn test_mark_synced_keeps_lock_state() {
        let (store, _temp) = setup("alice").await;
        store.lock_file("a.txt", "alice", "").await.unwrap();
        store.mark_synced("a.txt", "ts").await.unwrap();
        assert_eq!(store.get_file_state("a.txt").await, FileState::LockedLocal);
    }

    #[tokio::test]
    async fn test_sync_status_partitions() {
        let (store, _temp) = setup("alice").await;
        store.set_file_state("d.txt", FileState::Draft).await.unwrap();
        store.set_file_state("m.txt", FileState::Modified).await.unwrap();
        store.set_file_state("c.txt", FileState::Clean).await.unwrap();
        store.set_file_state("x.txt", FileState::Conflict).await.unwrap();
        store.lock_file("l.txt", "alice", "").await.unwrap();
        store.lock_file("r.txt", "bob", "").await.unwrap();

        let status = store.get_sync_status().await;
        assert_eq!(status.draft, vec!["d.txt"]);
        assert_eq!(status.modified, vec!["m.txt"]);
        assert_eq!(status.clean, vec!["c.txt"]);
        assert_eq!(status.conflict, vec!["x.txt"]);
        assert_eq!(status.locked_local, vec!["l.txt"]);
        assert_eq!(status.locked_remote, vec!["r.txt"]);
    }

    #[tokio::test]
    async fn test_clear_foreign_lock() {
        let (store, _temp) = setup("alice").await;
        store.lock_file("mine.txt", "alice", "").await.unwrap();
        store.lock_file("theirs.txt", "bob", "").await.unwrap();

        assert!(!store.clear_foreign_lock("mine.txt").await.unwrap());
        assert!(store.clear_foreign_lock("theirs.txt").await.unwrap());
        assert_eq!(store.get_file_state("theirs.txt").await, FileState::Clean);
        assert!(!store.clear_foreign_lock("unknown.txt").await.unwrap());
        assert!(store.get_record("unknown.txt").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_record() {
        let (store, _temp) = setup("alice").await;
        store.set_file_state("a.txt", FileState::Modified).await.unwrap();
        assert!(store.remove_record("a.txt").await.unwrap());
        assert!(!store.remove_record("a.txt").await.unwrap());
        assert_eq!(store.get_file_state("a.txt").await, FileState::Draft);
    }

    #[tokio::test]
    async fn test_mutation_before_initialize_fails() {
        let temp_dir = TempDir::new().unwrap();
        let store = MetadataStore::new(temp_dir.path(), "alice");
        let err = store.set_file_state("a.txt", FileState::Clean).await.unwrap_err();
        assert!(matches!(err, FilingError::NotInitialized(_)));
    }

    #[tokio::test]
    async fn test_lock_manager_impl() {
        let (store, _temp) = setup("alice").await;
        let locks: &dyn LockManager = &store;

        assert!(locks.acquire("a.txt", "alice", "r").await.unwrap().acquired);
        let refused = locks.acquire("a.txt", "bob", "r").await.unwrap();
        assert!(!refused.acquired);
        assert_eq!(refused.current_holder.as_deref(), Some("alice"));

        assert_eq!(locks.release("a.txt", "bob").await.unwrap().reason, "not_owner");
        assert!(locks.release("a.txt", "alice").await.unwrap().released);
        assert_eq!(locks.release("a.txt", "alice").await.unwrap().reason, "not_found");
        assert!(locks.locked_paths().await.unwrap().is_empty());
    }
}
