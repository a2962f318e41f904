use std::sync::Arc;

use async_trait::async_trait;
use filing_core::{
    EntryInfo, EventBus, FilingError, FilingEvent, FilingProvider, LockManager, SyncSummary,
};
use tracing::instrument;

use super::local::{normalize_file_path, LocalWorkingStore};
use crate::lock::MemoryLockManager;

/// Plain working-copy provider: no remote, no commit queue.
///
/// Locks go through a `LockManager` so the variant honors the same advisory
/// protocol as the others.
pub struct LocalFilingProvider {
    store: Arc<LocalWorkingStore>,
    locks: Arc<dyn LockManager>,
    user_id: String,
    events: EventBus,
}

impl LocalFilingProvider {
    pub fn new(store: Arc<LocalWorkingStore>, user_id: impl Into<String>, events: EventBus) -> Self {
        Self {
            store,
            locks: Arc::new(MemoryLockManager::new()),
            user_id: user_id.into(),
            events,
        }
    }

    /// Replace the lock registry, e.g. to share one with another provider.
    pub fn with_lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = locks;
        self
    }

    pub fn store(&self) -> &LocalWorkingStore {
        &self.store
    }

    async fn ensure_not_locked_by_other(&self, key: &str) -> Result<(), FilingError> {
        match self.locks.holder(key).await? {
            Some(lock) if lock.user_id != self.user_id => Err(FilingError::LockConflict {
                path: key.to_string(),
                holder: lock.user_id,
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl FilingProvider for LocalFilingProvider {
    fn provider_name(&self) -> &'static str {
        "local"
    }

    async fn initialize(&self) -> Result<(), FilingError> {
        self.store.ensure_root().await
    }

    #[instrument(skip(self, content), level = "debug")]
    async fn create(&self, path: &str, content: &[u8]) -> Result<(), FilingError> {
        let key = normalize_file_path(path)?;
        self.ensure_not_locked_by_other(&key).await?;
        self.store.create(&key, content).await?;
        self.events.emit(FilingEvent::FileCreated {
            path: key,
            provider: self.provider_name(),
        });
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, FilingError> {
        self.store.read(path).await
    }

    #[instrument(skip(self, content), level = "debug")]
    async fn update(&self, path: &str, content: &[u8]) -> Result<(), FilingError> {
        let key = normalize_file_path(path)?;
        self.ensure_not_locked_by_other(&key).await?;
        self.store.update(&key, content).await?;
        self.events.emit(FilingEvent::FileUpdated {
            path: key,
            provider: self.provider_name(),
        });
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, path: &str) -> Result<(), FilingError> {
        let key = normalize_file_path(path)?;
        self.ensure_not_locked_by_other(&key).await?;
        self.store.delete(&key).await?;
        self.events.emit(FilingEvent::FileDeleted {
            path: key,
            provider: self.provider_name(),
        });
        Ok(())
    }

    async fn list(&self, dir_path: &str) -> Result<Vec<EntryInfo>, FilingError> {
        self.store.list(dir_path).await
    }

    async fn exists(&self, path: &str) -> Result<bool, FilingError> {
        self.store.exists(path).await
    }

    async fn lock_file(&self, path: &str, reason: &str) -> Result<(), FilingError> {
        let key = normalize_file_path(path)?;
        self.locks
            .acquire(&key, &self.user_id, reason)
            .await?
            .into_result(&key)?;
        self.events.emit(FilingEvent::FileLocked {
            path: key,
            user_id: self.user_id.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn unlock_file(&self, path: &str) -> Result<(), FilingError> {
        let key = normalize_file_path(path)?;
        let result = self.locks.release(&key, &self.user_id).await?;
        if !result.released {
            return Err(FilingError::Ownership(format!(
                "{} cannot unlock {}: {}",
                self.user_id, key, result.reason
            )));
        }
        self.events.emit(FilingEvent::FileUnlocked {
            path: key,
            user_id: self.user_id.clone(),
        });
        Ok(())
    }

    /// Nothing to reconcile without a remote.
    async fn synchronize(&self) -> Result<SyncSummary, FilingError> {
        Ok(SyncSummary::default())
    }
}
