use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use filing_core::{
    EntryInfo, EventBus, FileState, FilingError, FilingEvent, FilingProvider, RemoteProvider,
    SyncStatus, SyncSummary,
};
use futures::FutureExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::metadata::MetadataStore;
use crate::scheduler::PeriodicTask;
use crate::storage::{normalize_file_path, LocalWorkingStore};

/// Tunables for `SyncFilingProvider`.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub sync_interval: Duration,
    /// Upper bound on every remote call
    pub op_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            op_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of `pull_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    Pulled { remote_timestamp: String },
    /// The remote has nothing at this path yet.
    NotFound,
}

/// What `sync_file` did for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Pushed,
    Pulled,
    NotOnRemote,
    Skipped,
    Conflict,
}

/// User decision for a path in `Conflict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Keep the working copy; it will be pushed on the next sync.
    KeepLocal,
    /// Discard the working copy in favor of the remote content.
    TakeRemote,
}

/// Working copy + metadata + remote, reconciled with "latest wins".
///
/// State transitions per path:
/// ```text
/// create        -> DRAFT
/// update        -> MODIFIED  (unless DRAFT or LOCKED_LOCAL)
/// push / pull   -> CLEAN     (lock states are kept)
/// lock / unlock -> LOCKED_LOCAL | LOCKED_REMOTE / CLEAN
/// ```
/// Operations on one path are serialized by a per-path mutex. When the remote
/// keeps a lock registry it is consulted before every mutation, so providers
/// sharing a remote see each other's locks.
pub struct SyncFilingProvider {
    store: Arc<LocalWorkingStore>,
    metadata: Arc<MetadataStore>,
    remote: Arc<dyn RemoteProvider>,
    events: EventBus,
    options: SyncOptions,
    path_locks: DashMap<String, Arc<Mutex<()>>>,
    auto_sync: Mutex<Option<PeriodicTask>>,
}

impl SyncFilingProvider {
    pub fn new(
        store: Arc<LocalWorkingStore>,
        metadata: Arc<MetadataStore>,
        remote: Arc<dyn RemoteProvider>,
        events: EventBus,
        options: SyncOptions,
    ) -> Self {
        Self {
            store,
            metadata,
            remote,
            events,
            options,
            path_locks: DashMap::new(),
            auto_sync: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> &str {
        self.metadata.user_id()
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub async fn file_state(&self, path: &str) -> Result<FileState, FilingError> {
        let key = normalize_file_path(path)?;
        Ok(self.metadata.get_file_state(&key).await)
    }

    pub async fn get_sync_status(&self) -> SyncStatus {
        self.metadata.get_sync_status().await
    }

    async fn path_guard(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self.path_locks.entry(key.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    async fn remote_call<T>(
        &self,
        what: &str,
        fut: impl Future<Output = Result<T, FilingError>>,
    ) -> Result<T, FilingError> {
        tokio::time::timeout(self.options.op_timeout, fut)
            .await
            .map_err(|_| {
                FilingError::Timeout(format!(
                    "{} on {} remote after {:?}",
                    what,
                    self.remote.backend_name(),
                    self.options.op_timeout
                ))
            })?
    }

    // =========================================================================
    // Lock view
    // =========================================================================

    /// Mirror the remote lock registry into local metadata for `key`.
    ///
    /// Returns the remote holder when it is somebody else. A lock the current
    /// user holds is renewed on the remote, or re-acquired if it expired
    /// there. If it expired and another user took it, the local lock is
    /// handed over to them. Remote failures leave the local view untouched.
    async fn refresh_remote_lock(&self, key: &str) -> Result<Option<String>, FilingError> {
        if !self.remote.supports_locking() {
            return Ok(None);
        }

        let remote_lock = match self
            .remote_call("lock_holder", self.remote.lock_holder(key))
            .await
        {
            Ok(lock) => lock,
            Err(e) => {
                warn!("Could not read remote lock for {}: {}", key, e);
                return Ok(None);
            }
        };

        let local_lock = self.metadata.lock_holder(key).await;
        let local_holder = local_lock.as_ref().map(|l| l.user_id.as_str());
        match remote_lock {
            Some(lock) if lock.user_id != self.user_id() => {
                if local_holder == Some(self.user_id()) {
                    self.hand_over_lock(key, &lock.user_id, &lock.reason).await?;
                } else if local_holder != Some(lock.user_id.as_str()) {
                    self.metadata.clear_foreign_lock(key).await?;
                    self.metadata
                        .lock_file(key, &lock.user_id, &lock.reason)
                        .await?;
                    debug!("Mirrored remote lock on {} held by {}", key, lock.user_id);
                }
                Ok(Some(lock.user_id))
            }
            _ => {
                match local_lock {
                    Some(own) if own.user_id == self.user_id() => {
                        if let Some(holder) = self.renew_remote_lock(key, &own.reason).await? {
                            return Ok(Some(holder));
                        }
                    }
                    _ => {
                        if self.metadata.clear_foreign_lock(key).await? {
                            debug!("Remote no longer locks {}; cleared local mirror", key);
                        }
                    }
                }
                Ok(None)
            }
        }
    }

    /// Extend (or re-acquire) the current user's remote lock on `key`.
    ///
    /// Returns the new holder if another user won the lock in the meantime.
    async fn renew_remote_lock(
        &self,
        key: &str,
        reason: &str,
    ) -> Result<Option<String>, FilingError> {
        let user_id = self.user_id().to_string();
        match self
            .remote_call("lock_file", self.remote.lock_file(key, &user_id, reason))
            .await
        {
            Ok(()) => {
                debug!("Renewed remote lock on {}", key);
                Ok(None)
            }
            Err(FilingError::LockConflict { holder, .. }) => {
                self.hand_over_lock(key, &holder, "").await?;
                Ok(Some(holder))
            }
            Err(e) => {
                warn!("Could not renew remote lock on {}: {}", key, e);
                Ok(None)
            }
        }
    }

    /// The current user's lock expired on the remote and `holder` took it.
    async fn hand_over_lock(
        &self,
        key: &str,
        holder: &str,
        reason: &str,
    ) -> Result<(), FilingError> {
        warn!("Lock on {} expired and was taken by {}", key, holder);
        self.metadata.unlock_file(key, self.user_id()).await?;
        self.metadata.lock_file(key, holder, reason).await?;
        self.events.emit(FilingEvent::RemoteLockFailed {
            path: key.to_string(),
            error: format!("lock expired and was taken by {}", holder),
        });
        Ok(())
    }

    /// Release the current user's remote lock, logging failures.
    async fn release_remote_lock(&self, key: &str) {
        if !self.remote.supports_locking() {
            return;
        }
        if let Err(e) = self
            .remote_call("unlock_file", self.remote.unlock_file(key, self.user_id()))
            .await
        {
            warn!("Remote unlock for {} failed: {}", key, e);
            self.events.emit(FilingEvent::RemoteLockFailed {
                path: key.to_string(),
                error: e.to_string(),
            });
        }
    }

    /// Reject when anyone but the current user holds `key`.
    async fn ensure_writable(&self, key: &str) -> Result<(), FilingError> {
        let remote_holder = self.refresh_remote_lock(key).await?;
        if let Some(lock) = self.metadata.lock_holder(key).await {
            if lock.user_id != self.user_id() {
                return Err(FilingError::LockConflict {
                    path: key.to_string(),
                    holder: lock.user_id,
                });
            }
        }
        if let Some(holder) = remote_holder {
            return Err(FilingError::LockConflict {
                path: key.to_string(),
                holder,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Push / Pull
    // =========================================================================

    /// Upload the working copy of `path` and mark it clean.
    ///
    /// Returns the recorded remote timestamp.
    pub async fn push_file(&self, path: &str) -> Result<String, FilingError> {
        let key = normalize_file_path(path)?;
        let _guard = self.path_guard(&key).await;
        self.push_locked(&key).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn push_locked(&self, key: &str) -> Result<String, FilingError> {
        self.refresh_remote_lock(key).await?;
        if self.metadata.get_file_state(key).await == FileState::LockedRemote {
            let holder = self
                .metadata
                .lock_holder(key)
                .await
                .map(|l| l.user_id)
                .unwrap_or_else(|| "unknown".to_string());
            return Err(FilingError::LockConflict {
                path: key.to_string(),
                holder,
            });
        }
        if !self.store.exists(key).await? {
            return Err(FilingError::NotFound(format!("no local copy of {}", key)));
        }

        let content = self.store.read(key).await?;
        self.remote_call("create", self.remote.create(key, &content))
            .await?;

        let remote_timestamp = Utc::now().to_rfc3339();
        self.metadata.mark_synced(key, &remote_timestamp).await?;
        debug!("Pushed {} ({} bytes)", key, content.len());
        self.events.emit(FilingEvent::FilePushed {
            path: key.to_string(),
            remote_timestamp: remote_timestamp.clone(),
        });
        Ok(remote_timestamp)
    }

    /// Download `path` from the remote into the working copy.
    ///
    /// Refused while the current user holds the lock, since the download
    /// would overwrite their edits.
    pub async fn pull_file(&self, path: &str) -> Result<PullOutcome, FilingError> {
        let key = normalize_file_path(path)?;
        let _guard = self.path_guard(&key).await;
        self.pull_locked(&key).await
    }

    async fn pull_locked(&self, key: &str) -> Result<PullOutcome, FilingError> {
        if self.metadata.is_locked_by_current_user(key).await {
            return Err(FilingError::LockConflict {
                path: key.to_string(),
                holder: self.user_id().to_string(),
            });
        }
        self.download(key).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn download(&self, key: &str) -> Result<PullOutcome, FilingError> {
        let content = match self.remote_call("read", self.remote.read(key)).await {
            Ok(content) => content,
            Err(e) if e.is_not_found() => {
                debug!("{} not on remote yet", key);
                self.events.emit(FilingEvent::FileNotOnRemote {
                    path: key.to_string(),
                });
                return Ok(PullOutcome::NotFound);
            }
            Err(e) => return Err(e),
        };

        self.store.create(key, &content).await?;
        let remote_timestamp = Utc::now().to_rfc3339();
        self.metadata.mark_synced(key, &remote_timestamp).await?;
        debug!("Pulled {} ({} bytes)", key, content.len());
        self.events.emit(FilingEvent::FilePulled {
            path: key.to_string(),
            remote_timestamp: remote_timestamp.clone(),
        });
        Ok(PullOutcome::Pulled { remote_timestamp })
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Reconcile one path according to its state.
    pub async fn sync_file(&self, path: &str) -> Result<SyncOutcome, FilingError> {
        let key = normalize_file_path(path)?;
        let _guard = self.path_guard(&key).await;
        self.sync_locked(&key).await
    }

    async fn sync_locked(&self, key: &str) -> Result<SyncOutcome, FilingError> {
        match self.metadata.get_file_state(key).await {
            FileState::Draft | FileState::LockedLocal | FileState::LockedRemote => {
                Ok(SyncOutcome::Skipped)
            }
            FileState::Modified => {
                if self.metadata.is_locked_by_other_user(key).await {
                    return Ok(SyncOutcome::Skipped);
                }
                self.push_locked(key).await?;
                Ok(SyncOutcome::Pushed)
            }
            FileState::Clean => match self.pull_locked(key).await? {
                PullOutcome::Pulled { .. } => Ok(SyncOutcome::Pulled),
                PullOutcome::NotFound => Ok(SyncOutcome::NotOnRemote),
            },
            FileState::Conflict => {
                self.events.emit(FilingEvent::SyncConflict {
                    path: key.to_string(),
                });
                Ok(SyncOutcome::Conflict)
            }
        }
    }

    async fn delete_locked(&self, key: &str) -> Result<(), FilingError> {
        self.ensure_writable(key).await?;

        let local = match self.store.delete(key).await {
            Ok(()) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };
        let held = self.metadata.is_locked_by_current_user(key).await;
        if held {
            self.release_remote_lock(key).await;
        }
        let known = self.metadata.remove_record(key).await?;
        if !local && !known {
            return Err(FilingError::NotFound(key.to_string()));
        }
        if held {
            self.events.emit(FilingEvent::FileUnlocked {
                path: key.to_string(),
                user_id: self.user_id().to_string(),
            });
        }
        self.events.emit(FilingEvent::FileDeleted {
            path: key.to_string(),
            provider: self.provider_name(),
        });
        Ok(())
    }

    /// Sync every clean and modified path, isolating per-file failures.
    #[instrument(skip(self), level = "debug")]
    pub async fn sync_all(&self) -> SyncSummary {
        let status = self.metadata.get_sync_status().await;
        let mut summary = SyncSummary::default();

        for key in status.clean.iter().chain(status.modified.iter()) {
            let _guard = self.path_guard(key).await;
            match self.sync_locked(key).await {
                Ok(SyncOutcome::Pushed | SyncOutcome::Pulled) => summary.synced += 1,
                Ok(_) => summary.skipped += 1,
                Err(e) => {
                    warn!("Sync failed for {}: {}", key, e);
                    self.events.emit(FilingEvent::SyncError {
                        path: key.clone(),
                        error: e.to_string(),
                    });
                    summary.record_error(key, &e);
                }
            }
        }

        // Forget mutexes nobody is waiting on
        self.path_locks.retain(|_, lock| Arc::strong_count(lock) > 1);

        info!(
            "Sync completed: {} synced, {} skipped, {} failed",
            summary.synced, summary.skipped, summary.failed
        );
        self.events.emit(FilingEvent::SyncCompleted {
            synced: summary.synced,
            skipped: summary.skipped,
            failed: summary.failed,
        });
        summary
    }

    /// Apply changes the remote reports for `paths`.
    ///
    /// A path the current user holds is marked `Conflict` instead of pulled.
    #[instrument(skip(self, paths), level = "debug", fields(count = paths.len()))]
    pub async fn process_remote_changes(&self, paths: &[String]) -> SyncSummary {
        let mut summary = SyncSummary::default();

        for path in paths {
            let key = match normalize_file_path(path) {
                Ok(key) => key,
                Err(e) => {
                    summary.record_error(path, &e);
                    continue;
                }
            };
            let _guard = self.path_guard(&key).await;

            let result = if self.metadata.is_locked_by_current_user(&key).await {
                self.metadata
                    .set_file_state(&key, FileState::Conflict)
                    .await
                    .map(|_| {
                        self.events.emit(FilingEvent::SyncConflict { path: key.clone() });
                        false
                    })
            } else {
                self.download(&key)
                    .await
                    .map(|outcome| matches!(outcome, PullOutcome::Pulled { .. }))
            };

            match result {
                Ok(true) => summary.synced += 1,
                Ok(false) => summary.skipped += 1,
                Err(e) => {
                    warn!("Remote change for {} failed: {}", key, e);
                    self.events.emit(FilingEvent::SyncError {
                        path: key.clone(),
                        error: e.to_string(),
                    });
                    summary.record_error(&key, &e);
                }
            }
        }

        summary
    }

    /// Leave `Conflict` by an explicit user decision.
    #[instrument(skip(self), level = "debug")]
    pub async fn resolve_conflict(
        &self,
        path: &str,
        resolution: Resolution,
    ) -> Result<(), FilingError> {
        let key = normalize_file_path(path)?;
        let _guard = self.path_guard(&key).await;

        let state = self.metadata.get_file_state(&key).await;
        if state != FileState::Conflict {
            return Err(FilingError::InvalidArgument(format!(
                "{} is {}, not in conflict",
                key, state
            )));
        }

        match resolution {
            Resolution::KeepLocal => {
                let next = if self.metadata.is_locked_by_current_user(&key).await {
                    FileState::LockedLocal
                } else {
                    FileState::Modified
                };
                self.metadata.set_file_state(&key, next).await
            }
            Resolution::TakeRemote => match self.download(&key).await? {
                PullOutcome::Pulled { .. } => Ok(()),
                PullOutcome::NotFound => {
                    Err(FilingError::NotFound(format!("{} is not on the remote", key)))
                }
            },
        }
    }

    // =========================================================================
    // Auto sync
    // =========================================================================

    /// Start running `sync_all` every `sync_interval`. Returns false if
    /// already running.
    pub async fn start_auto_sync(self: &Arc<Self>) -> bool {
        let mut slot = self.auto_sync.lock().await;
        if slot.is_some() {
            return false;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        *slot = Some(PeriodicTask::start(
            "auto-sync",
            self.options.sync_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(provider) = weak.upgrade() {
                        provider.sync_all().await;
                    }
                }
                .boxed()
            },
        ));
        true
    }

    /// Stop the auto-sync loop, waiting for an in-flight pass.
    pub async fn stop_auto_sync(&self) {
        let task = self.auto_sync.lock().await.take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    pub async fn is_auto_syncing(&self) -> bool {
        self.auto_sync.lock().await.is_some()
    }
}

#[async_trait]
impl FilingProvider for SyncFilingProvider {
    fn provider_name(&self) -> &'static str {
        "sync"
    }

    async fn initialize(&self) -> Result<(), FilingError> {
        self.store.ensure_root().await?;
        self.metadata.initialize().await?;
        info!(
            "Sync provider ready: {} -> {} remote",
            self.store.root().display(),
            self.remote.backend_name()
        );
        Ok(())
    }

    #[instrument(skip(self, content), level = "debug", fields(content_len = content.len()))]
    async fn create(&self, path: &str, content: &[u8]) -> Result<(), FilingError> {
        let key = normalize_file_path(path)?;
        let _guard = self.path_guard(&key).await;
        self.ensure_writable(&key).await?;

        self.store.create(&key, content).await?;
        if !self.metadata.is_locked_by_current_user(&key).await {
            self.metadata.set_file_state(&key, FileState::Draft).await?;
        }
        self.events.emit(FilingEvent::FileCreated {
            path: key,
            provider: self.provider_name(),
        });
        Ok(())
    }

    /// Local copy first; falls back to pulling from the remote.
    async fn read(&self, path: &str) -> Result<Vec<u8>, FilingError> {
        let key = normalize_file_path(path)?;
        let _guard = self.path_guard(&key).await;

        match self.store.read(&key).await {
            Err(e) if e.is_not_found() => match self.pull_locked(&key).await? {
                PullOutcome::Pulled { .. } => self.store.read(&key).await,
                PullOutcome::NotFound => Err(FilingError::NotFound(key)),
            },
            other => other,
        }
    }

    #[instrument(skip(self, content), level = "debug", fields(content_len = content.len()))]
    async fn update(&self, path: &str, content: &[u8]) -> Result<(), FilingError> {
        let key = normalize_file_path(path)?;
        let _guard = self.path_guard(&key).await;
        self.ensure_writable(&key).await?;

        self.store.update(&key, content).await?;
        let state = self.metadata.get_file_state(&key).await;
        if !matches!(state, FileState::Draft | FileState::LockedLocal) {
            self.metadata.set_file_state(&key, FileState::Modified).await?;
        }
        self.events.emit(FilingEvent::FileUpdated {
            path: key,
            provider: self.provider_name(),
        });
        Ok(())
    }

    /// Deleting a file the current user holds also releases its lock.
    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, path: &str) -> Result<(), FilingError> {
        let key = normalize_file_path(path)?;
        let guard = self.path_guard(&key).await;
        let result = self.delete_locked(&key).await;
        drop(guard);
        self.path_locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn list(&self, dir_path: &str) -> Result<Vec<EntryInfo>, FilingError> {
        self.store.list(dir_path).await
    }

    async fn exists(&self, path: &str) -> Result<bool, FilingError> {
        self.store.exists(path).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn lock_file(&self, path: &str, reason: &str) -> Result<(), FilingError> {
        let key = normalize_file_path(path)?;
        let _guard = self.path_guard(&key).await;
        self.ensure_writable(&key).await?;

        let user_id = self.user_id().to_string();
        self.metadata.lock_file(&key, &user_id, reason).await?;

        if self.remote.supports_locking() {
            if let Err(e) = self
                .remote_call("lock_file", self.remote.lock_file(&key, &user_id, reason))
                .await
            {
                warn!("Remote lock for {} failed, keeping local lock: {}", key, e);
                self.events.emit(FilingEvent::RemoteLockFailed {
                    path: key.clone(),
                    error: e.to_string(),
                });
            }
        }

        self.events.emit(FilingEvent::FileLocked {
            path: key,
            user_id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn unlock_file(&self, path: &str) -> Result<(), FilingError> {
        let key = normalize_file_path(path)?;
        let _guard = self.path_guard(&key).await;

        let user_id = self.user_id().to_string();
        self.metadata.unlock_file(&key, &user_id).await?;
        self.release_remote_lock(&key).await;

        self.events.emit(FilingEvent::FileUnlocked { path: key, user_id });
        Ok(())
    }

    async fn synchronize(&self) -> Result<SyncSummary, FilingError> {
        Ok(self.sync_all().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::DirectoryRemote;
    use filing_core::LockRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Counts every call that reaches the wrapped remote.
    struct CountingRemote {
        inner: DirectoryRemote,
        calls: AtomicUsize,
    }

    impl CountingRemote {
        fn hit(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RemoteProvider for CountingRemote {
        fn backend_name(&self) -> &'static str {
            "counting"
        }

        async fn create(&self, path: &str, content: &[u8]) -> Result<(), FilingError> {
            self.hit();
            self.inner.create(path, content).await
        }

        async fn read(&self, path: &str) -> Result<Vec<u8>, FilingError> {
            self.hit();
            self.inner.read(path).await
        }

        async fn delete(&self, path: &str) -> Result<(), FilingError> {
            self.hit();
            self.inner.delete(path).await
        }

        async fn list(&self, dir_path: &str) -> Result<Vec<String>, FilingError> {
            self.hit();
            self.inner.list(dir_path).await
        }

        fn supports_locking(&self) -> bool {
            true
        }

        async fn lock_file(&self, path: &str, user_id: &str, reason: &str) -> Result<(), FilingError> {
            self.hit();
            self.inner.lock_file(path, user_id, reason).await
        }

        async fn unlock_file(&self, path: &str, user_id: &str) -> Result<(), FilingError> {
            self.hit();
            self.inner.unlock_file(path, user_id).await
        }

        async fn lock_holder(&self, path: &str) -> Result<Option<LockRecord>, FilingError> {
            self.hit();
            self.inner.lock_holder(path).await
        }
    }

    /// A remote whose every call fails.
    struct BrokenRemote;

    #[async_trait]
    impl RemoteProvider for BrokenRemote {
        fn backend_name(&self) -> &'static str {
            "broken"
        }

        async fn create(&self, _path: &str, _content: &[u8]) -> Result<(), FilingError> {
            Err(FilingError::Remote("offline".into()))
        }

        async fn read(&self, _path: &str) -> Result<Vec<u8>, FilingError> {
            Err(FilingError::Remote("offline".into()))
        }

        async fn delete(&self, _path: &str) -> Result<(), FilingError> {
            Err(FilingError::Remote("offline".into()))
        }

        async fn list(&self, _dir_path: &str) -> Result<Vec<String>, FilingError> {
            Err(FilingError::Remote("offline".into()))
        }

        fn supports_locking(&self) -> bool {
            true
        }

        async fn lock_file(&self, _p: &str, _u: &str, _r: &str) -> Result<(), FilingError> {
            Err(FilingError::Remote("offline".into()))
        }

        async fn lock_holder(&self, _path: &str) -> Result<Option<LockRecord>, FilingError> {
            Err(FilingError::Remote("offline".into()))
        }
    }

    async fn provider_with(
        temp: &TempDir,
        user: &str,
        remote: Arc<dyn RemoteProvider>,
    ) -> SyncFilingProvider {
        let base = temp.path().join(user);
        let provider = SyncFilingProvider::new(
            Arc::new(LocalWorkingStore::new(base.join("work"))),
            Arc::new(MetadataStore::new(base.join("meta"), user)),
            remote,
            EventBus::default(),
            SyncOptions::default(),
        );
        provider.initialize().await.unwrap();
        provider
    }

    async fn setup() -> (SyncFilingProvider, Arc<DirectoryRemote>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let remote = Arc::new(DirectoryRemote::new(
            temp_dir.path().join("remote"),
            Duration::from_secs(60),
        ));
        let provider = provider_with(&temp_dir, "alice", remote.clone()).await;
        (provider, remote, temp_dir)
    }

    #[tokio::test]
    async fn test_create_is_draft_and_push_is_clean() {
        let (provider, remote, _temp) = setup().await;

        provider.create("docs/a.txt", b"hello").await.unwrap();
        assert_eq!(provider.file_state("docs/a.txt").await.unwrap(), FileState::Draft);

        provider.push_file("docs/a.txt").await.unwrap();
        assert_eq!(provider.file_state("docs/a.txt").await.unwrap(), FileState::Clean);
        assert_eq!(remote.read("docs/a.txt").await.unwrap(), b"hello");
        assert!(provider
            .metadata()
            .get_record("docs/a.txt")
            .await
            .unwrap()
            .remote_timestamp
            .is_some());
    }

    #[tokio::test]
    async fn test_update_transitions() {
        let (provider, _remote, _temp) = setup().await;

        provider.create("a.txt", b"1").await.unwrap();
        provider.update("a.txt", b"2").await.unwrap();
        assert_eq!(provider.file_state("a.txt").await.unwrap(), FileState::Draft);

        provider.push_file("a.txt").await.unwrap();
        provider.update("a.txt", b"3").await.unwrap();
        assert_eq!(provider.file_state("a.txt").await.unwrap(), FileState::Modified);

        provider.lock_file("a.txt", "editing").await.unwrap();
        provider.update("a.txt", b"4").await.unwrap();
        assert_eq!(provider.file_state("a.txt").await.unwrap(), FileState::LockedLocal);
    }

    #[tokio::test]
    async fn test_sync_file_on_draft_makes_no_remote_calls() {
        let temp_dir = TempDir::new().unwrap();
        let remote = Arc::new(CountingRemote {
            inner: DirectoryRemote::new(temp_dir.path().join("remote"), Duration::from_secs(60)),
            calls: AtomicUsize::new(0),
        });
        let provider = provider_with(&temp_dir, "alice", remote.clone()).await;

        provider.create("a.txt", b"draft").await.unwrap();
        remote.calls.store(0, Ordering::SeqCst);

        let outcome = provider.sync_file("a.txt").await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pull_rejected_when_locked_by_current_user() {
        let (provider, remote, _temp) = setup().await;
        remote.create("a.txt", b"remote").await.unwrap();

        provider.lock_file("a.txt", "editing").await.unwrap();
        let err = provider.pull_file("a.txt").await.unwrap_err();
        assert!(err.is_lock_conflict());
    }

    #[tokio::test]
    async fn test_push_rejected_when_locked_remote() {
        let (provider, remote, _temp) = setup().await;
        provider.create("a.txt", b"mine").await.unwrap();
        remote.lock_file("a.txt", "bob", "review").await.unwrap();

        let err = provider.push_file("a.txt").await.unwrap_err();
        assert!(matches!(err, FilingError::LockConflict { ref holder, .. } if holder == "bob"));
        assert_eq!(provider.file_state("a.txt").await.unwrap(), FileState::LockedRemote);
        assert!(remote.read("a.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_pull_missing_is_benign() {
        let (provider, _remote, _temp) = setup().await;
        assert_eq!(provider.pull_file("nope.txt").await.unwrap(), PullOutcome::NotFound);
        assert!(provider.read("nope.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_read_falls_back_to_remote() {
        let (provider, remote, _temp) = setup().await;
        remote.create("shared.txt", b"from remote").await.unwrap();

        assert_eq!(provider.read("shared.txt").await.unwrap(), b"from remote");
        assert_eq!(provider.file_state("shared.txt").await.unwrap(), FileState::Clean);
    }

    #[tokio::test]
    async fn test_push_without_local_copy() {
        let (provider, _remote, _temp) = setup().await;
        assert!(provider.push_file("ghost.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let (provider, _remote, _temp) = setup().await;
        provider.create("a.txt", b"x").await.unwrap();
        provider.delete("a.txt").await.unwrap();
        assert!(!provider.exists("a.txt").await.unwrap());
        assert!(provider.metadata().get_record("a.txt").await.is_none());
        assert!(provider.delete("a.txt").await.unwrap_err().is_not_found());
        assert!(provider.path_locks.is_empty());
    }

    #[tokio::test]
    async fn test_delete_releases_own_lock() {
        let (provider, remote, _temp) = setup().await;
        provider.create("a.txt", b"x").await.unwrap();
        provider.push_file("a.txt").await.unwrap();
        provider.lock_file("a.txt", "editing").await.unwrap();
        assert!(remote.lock_holder("a.txt").await.unwrap().is_some());

        provider.delete("a.txt").await.unwrap();
        assert!(remote.lock_holder("a.txt").await.unwrap().is_none());
        assert!(provider.metadata().lock_holder("a.txt").await.is_none());
    }

    #[tokio::test]
    async fn test_sync_all_forgets_idle_path_mutexes() {
        let (provider, _remote, _temp) = setup().await;
        for name in ["a.txt", "b.txt", "c.txt"] {
            provider.create(name, b"x").await.unwrap();
            provider.push_file(name).await.unwrap();
        }
        assert_eq!(provider.path_locks.len(), 3);

        provider.sync_all().await;
        assert!(provider.path_locks.is_empty());
    }

    #[tokio::test]
    async fn test_sync_all_pushes_and_pulls() {
        let (provider, remote, _temp) = setup().await;
        provider.create("a.txt", b"a").await.unwrap();
        provider.push_file("a.txt").await.unwrap();
        provider.update("a.txt", b"a2").await.unwrap();

        provider.create("b.txt", b"b").await.unwrap();
        provider.push_file("b.txt").await.unwrap();
        remote.create("b.txt", b"b-remote").await.unwrap();

        provider.create("draft.txt", b"d").await.unwrap();

        let mut rx = provider.events.subscribe();
        let summary = provider.sync_all().await;
        assert_eq!(summary.synced, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(remote.read("a.txt").await.unwrap(), b"a2");
        assert_eq!(provider.read("b.txt").await.unwrap(), b"b-remote");
        assert!(remote.read("draft.txt").await.unwrap_err().is_not_found());

        let mut completed = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, FilingEvent::SyncCompleted { synced: 2, .. }) {
                completed = true;
            }
        }
        assert!(completed);
    }

    #[tokio::test]
    async fn test_sync_all_isolates_failures() {
        let temp_dir = TempDir::new().unwrap();
        let provider = provider_with(&temp_dir, "alice", Arc::new(BrokenRemote)).await;
        provider.create("a.txt", b"x").await.unwrap();
        provider.metadata().set_file_state("a.txt", FileState::Modified).await.unwrap();
        provider.create("b.txt", b"y").await.unwrap();
        provider.metadata().set_file_state("b.txt", FileState::Clean).await.unwrap();

        let summary = provider.sync_all().await;
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.errors.len(), 2);
        assert_eq!(provider.file_state("a.txt").await.unwrap(), FileState::Modified);
    }

    #[tokio::test]
    async fn test_remote_lock_failure_keeps_local_lock() {
        let temp_dir = TempDir::new().unwrap();
        let provider = provider_with(&temp_dir, "alice", Arc::new(BrokenRemote)).await;
        let mut rx = provider.events.subscribe();

        provider.lock_file("a.txt", "editing").await.unwrap();
        assert_eq!(provider.file_state("a.txt").await.unwrap(), FileState::LockedLocal);

        let mut failed = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, FilingEvent::RemoteLockFailed { .. }) {
                failed = true;
            }
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn test_process_remote_changes_marks_conflict() {
        let (provider, remote, _temp) = setup().await;
        remote.create("mine.txt", b"remote").await.unwrap();
        remote.create("theirs.txt", b"remote").await.unwrap();

        provider.create("mine.txt", b"local").await.unwrap();
        provider.lock_file("mine.txt", "editing").await.unwrap();

        let summary = provider
            .process_remote_changes(&["mine.txt".to_string(), "theirs.txt".to_string()])
            .await;
        assert_eq!(summary.synced, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(provider.file_state("mine.txt").await.unwrap(), FileState::Conflict);
        assert_eq!(provider.read("mine.txt").await.unwrap(), b"local");
        assert_eq!(provider.file_state("theirs.txt").await.unwrap(), FileState::Clean);
    }

    #[tokio::test]
    async fn test_resolve_conflict() {
        let (provider, remote, _temp) = setup().await;
        remote.create("a.txt", b"remote").await.unwrap();
        provider.create("a.txt", b"local").await.unwrap();
        provider.metadata().set_file_state("a.txt", FileState::Conflict).await.unwrap();

        provider.resolve_conflict("a.txt", Resolution::TakeRemote).await.unwrap();
        assert_eq!(provider.read("a.txt").await.unwrap(), b"remote");
        assert_eq!(provider.file_state("a.txt").await.unwrap(), FileState::Clean);

        let err = provider
            .resolve_conflict("a.txt", Resolution::KeepLocal)
            .await
            .unwrap_err();
        assert!(matches!(err, FilingError::InvalidArgument(_)));

        provider.metadata().set_file_state("a.txt", FileState::Conflict).await.unwrap();
        provider.resolve_conflict("a.txt", Resolution::KeepLocal).await.unwrap();
        assert_eq!(provider.file_state("a.txt").await.unwrap(), FileState::Modified);
    }

    #[tokio::test]
    async fn test_auto_sync_start_stop() {
        let temp_dir = TempDir::new().unwrap();
        let remote = Arc::new(DirectoryRemote::new(
            temp_dir.path().join("remote"),
            Duration::from_secs(60),
        ));
        let base = temp_dir.path().join("alice");
        let provider = Arc::new(SyncFilingProvider::new(
            Arc::new(LocalWorkingStore::new(base.join("work"))),
            Arc::new(MetadataStore::new(base.join("meta"), "alice")),
            remote.clone(),
            EventBus::default(),
            SyncOptions {
                sync_interval: Duration::from_millis(10),
                ..SyncOptions::default()
            },
        ));
        provider.initialize().await.unwrap();
        provider.create("a.txt", b"x").await.unwrap();
        provider.metadata().set_file_state("a.txt", FileState::Modified).await.unwrap();

        assert!(provider.start_auto_sync().await);
        assert!(!provider.start_auto_sync().await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        provider.stop_auto_sync().await;
        assert!(!provider.is_auto_syncing().await);

        assert_eq!(remote.read("a.txt").await.unwrap(), b"x");
        assert_eq!(provider.file_state("a.txt").await.unwrap(), FileState::Clean);
    }
}
