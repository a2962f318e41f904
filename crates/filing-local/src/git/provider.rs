use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use filing_core::{
    CommitMetadata, EntryInfo, EventBus, FilingError, FilingEvent, FilingProvider, LockManager,
    PendingCommit, SyncSummary,
};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use super::repo::{self, FetchAction, FetchReport, GitStatus, PushOutcome};
use crate::lock::MemoryLockManager;
use crate::queue::CommitQueue;
use crate::scheduler::PeriodicTask;
use crate::storage::{normalize_file_path, LocalWorkingStore};

/// Settings for `GitFilingProvider`.
#[derive(Clone)]
pub struct GitOptions {
    pub remote_url: String,
    pub branch: String,
    pub username: Option<String>,
    pub token: Option<String>,
    pub author_name: String,
    pub author_email: String,
    /// Identity used for pending commits and locks
    pub user_id: String,
    pub fetch_interval: Duration,
    /// Upper bound on clone, fetch and push
    pub op_timeout: Duration,
}

impl GitOptions {
    pub fn new(remote_url: impl Into<String>, user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            remote_url: remote_url.into(),
            branch: "main".to_string(),
            username: None,
            token: None,
            author_name: user_id.clone(),
            author_email: format!("{}@localhost", user_id),
            user_id,
            fetch_interval: Duration::from_secs(60),
            op_timeout: Duration::from_secs(120),
        }
    }
}

impl std::fmt::Debug for GitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitOptions")
            .field("remote_url", &self.remote_url)
            .field("branch", &self.branch)
            .field("username", &self.username)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("author_name", &self.author_name)
            .field("author_email", &self.author_email)
            .field("user_id", &self.user_id)
            .field("fetch_interval", &self.fetch_interval)
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitPhase {
    Uninitialized,
    /// Options validated; the working tree is not ready yet.
    Configured,
    Ready,
}

/// `get_status` result.
#[derive(Debug, Clone, Serialize)]
pub struct GitProviderStatus {
    pub git: GitStatus,
    pub pending_commits: usize,
    pub locked_paths: Vec<String>,
}

/// Cloned working tree + deferred commit queue against a Git remote.
///
/// Mutations write the working tree, stage the path and queue a pending
/// commit; nothing is committed until `commit_with_message` supplies a
/// human-authored message. Remote divergence resolves as "latest wins".
pub struct GitFilingProvider {
    options: GitOptions,
    store: Arc<LocalWorkingStore>,
    queue: Arc<CommitQueue>,
    locks: Arc<dyn LockManager>,
    events: EventBus,
    phase: RwLock<GitPhase>,
    /// Serializes index and ref updates
    git_lock: Mutex<()>,
    /// Held by whatever touches `.git` or the working tree, including a
    /// blocking job that outlived its timeout
    job_lock: Arc<Mutex<()>>,
    auto_fetch: Mutex<Option<PeriodicTask>>,
}

impl GitFilingProvider {
    pub fn new(
        options: GitOptions,
        workdir: impl AsRef<Path>,
        queue: Arc<CommitQueue>,
        events: EventBus,
    ) -> Self {
        Self {
            options,
            store: Arc::new(LocalWorkingStore::new(workdir)),
            queue,
            locks: Arc::new(MemoryLockManager::new()),
            events,
            phase: RwLock::new(GitPhase::Uninitialized),
            git_lock: Mutex::new(()),
            job_lock: Arc::new(Mutex::new(())),
            auto_fetch: Mutex::new(None),
        }
    }

    /// Replace the default in-memory lock registry.
    pub fn with_lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = locks;
        self
    }

    pub fn options(&self) -> &GitOptions {
        &self.options
    }

    pub fn workdir(&self) -> &Path {
        self.store.root()
    }

    pub fn queue(&self) -> &CommitQueue {
        &self.queue
    }

    pub async fn phase(&self) -> GitPhase {
        *self.phase.read().await
    }

    async fn ensure_ready(&self) -> Result<(), FilingError> {
        match *self.phase.read().await {
            GitPhase::Ready => Ok(()),
            phase => Err(FilingError::NotInitialized(format!(
                "git provider is {:?}",
                phase
            ))),
        }
    }

    /// Run a git2 job on the blocking pool.
    ///
    /// The job owns the job lock until it returns, even if the caller stops
    /// waiting for it.
    async fn blocking<T, F>(&self, what: &'static str, job: F) -> Result<T, FilingError>
    where
        F: FnOnce(&GitOptions, &Path) -> Result<T, FilingError> + Send + 'static,
        T: Send + 'static,
    {
        let options = self.options.clone();
        let workdir = self.store.root().to_path_buf();
        let guard = self.job_lock.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let _job = guard;
            job(&options, &workdir)
        })
        .await
        .map_err(|e| FilingError::Internal(format!("{} task failed: {}", what, e)))?
    }

    /// Like `blocking`, bounded by `op_timeout`. On timeout the job is asked
    /// to abort through its cancel flag.
    async fn network<T, F>(&self, what: &'static str, job: F) -> Result<T, FilingError>
    where
        F: FnOnce(&GitOptions, &Path, &AtomicBool) -> Result<T, FilingError> + Send + 'static,
        T: Send + 'static,
    {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        let run = self.blocking(what, move |options, workdir| job(options, workdir, &flag));
        match tokio::time::timeout(self.options.op_timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                cancel.store(true, Ordering::SeqCst);
                warn!("{} timed out after {:?}; cancelling", what, self.options.op_timeout);
                Err(FilingError::Timeout(format!(
                    "{} after {:?}",
                    what, self.options.op_timeout
                )))
            }
        }
    }

    async fn ensure_not_locked_by_other(&self, key: &str) -> Result<(), FilingError> {
        match self.locks.holder(key).await? {
            Some(lock) if lock.user_id != self.options.user_id => Err(FilingError::LockConflict {
                path: key.to_string(),
                holder: lock.user_id,
            }),
            _ => Ok(()),
        }
    }

    /// Stage `key` and queue a pending commit for it.
    async fn stage_and_queue(
        &self,
        key: &str,
        removed: bool,
        metadata: CommitMetadata,
    ) -> Result<String, FilingError> {
        let staged = key.to_string();
        self.blocking("stage", move |_, workdir| repo::stage(workdir, &staged, removed))
            .await?;

        let files = vec![key.to_string()];
        let commit_id = self
            .queue
            .add_pending_commit(files.clone(), &self.options.user_id, metadata)
            .await?;
        self.events.emit(FilingEvent::CommitQueued {
            commit_id: commit_id.clone(),
            files,
            user_id: self.options.user_id.clone(),
        });
        Ok(commit_id)
    }

    async fn write(&self, path: &str, content: &[u8], operation: &str) -> Result<String, FilingError> {
        let key = normalize_file_path(path)?;
        self.ensure_ready().await?;
        self.ensure_not_locked_by_other(&key).await?;

        let _git = self.git_lock.lock().await;
        {
            let _job = self.job_lock.lock().await;
            self.store.create(&key, content).await?;
        }
        self.stage_and_queue(
            &key,
            false,
            CommitMetadata::operation(operation, Some(content.len() as u64)),
        )
        .await
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Commit the files of pending commit `commit_id` with `message`.
    ///
    /// Only the commit's owner may do this. If Git fails the change set goes
    /// back into the queue with its retry marker set and the error is
    /// returned. A change set whose files already match HEAD (an earlier
    /// commit took their current content) is dropped with `InvalidArgument`.
    /// Returns the new commit id.
    #[instrument(skip(self, message), level = "debug")]
    pub async fn commit_with_message(
        &self,
        commit_id: &str,
        message: &str,
        user_id: &str,
    ) -> Result<String, FilingError> {
        self.ensure_ready().await?;
        let completed = self
            .queue
            .complete_pending_commit(commit_id, message, user_id)
            .await?;

        let _git = self.git_lock.lock().await;
        let files = completed.files.clone();
        let msg = completed.commit_message.clone();
        match self
            .blocking("commit", move |options, workdir| {
                repo::commit_files(options, workdir, &files, &msg)
            })
            .await
        {
            Ok(None) => {
                warn!("Pending commit {} has no changes left; dropped", completed.id);
                Err(FilingError::InvalidArgument(format!(
                    "pending commit {} has nothing to commit: {} already match HEAD",
                    completed.id,
                    completed.files.join(", ")
                )))
            }
            Ok(Some(sha)) => {
                self.events.emit(FilingEvent::CommitCompleted {
                    commit_id: completed.id.clone(),
                    sha: sha.clone(),
                    message: completed.commit_message.clone(),
                });
                Ok(sha)
            }
            Err(e) => {
                let retry_id = self.queue.requeue(&completed).await?;
                warn!(
                    "Commit of {} failed, re-queued as {}: {}",
                    completed.id, retry_id, e
                );
                self.events.emit(FilingEvent::CommitRequeued {
                    commit_id: retry_id,
                    previous_id: completed.id.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Drop a pending commit without committing. The staged files stay staged.
    pub async fn cancel_pending_commit(
        &self,
        commit_id: &str,
        user_id: &str,
    ) -> Result<PendingCommit, FilingError> {
        let cancelled = self.queue.cancel_pending_commit(commit_id, user_id).await?;
        self.events.emit(FilingEvent::CommitCancelled {
            commit_id: cancelled.id.clone(),
            user_id: user_id.to_string(),
        });
        Ok(cancelled)
    }

    pub async fn pending_commits(&self) -> Vec<PendingCommit> {
        self.queue.get_all_pending_commits().await
    }

    // =========================================================================
    // Remote
    // =========================================================================

    /// Fetch origin and integrate it ("latest wins" on conflict).
    pub async fn fetch(&self) -> Result<FetchReport, FilingError> {
        self.ensure_ready().await?;
        let _git = self.git_lock.lock().await;
        self.fetch_locked().await
    }

    async fn fetch_locked(&self) -> Result<FetchReport, FilingError> {
        let report = self.network("fetch", repo::fetch).await?;
        let branch = self.options.branch.clone();
        let head = report.head.clone().unwrap_or_default();

        self.events.emit(FilingEvent::GitFetched {
            branch: branch.clone(),
            ahead: report.ahead,
            behind: report.behind,
        });
        match report.action {
            FetchAction::FastForwarded | FetchAction::Merged => {
                info!("Pulled origin/{} ({:?}) -> {}", branch, report.action, head);
                self.events.emit(FilingEvent::GitPulled { branch, head });
            }
            FetchAction::ResetToRemote => {
                let affected_pending_files = self.queue.pending_files().await;
                warn!(
                    "Reset {} to origin (latest wins); {} queued files affected",
                    branch,
                    affected_pending_files.len()
                );
                self.events.emit(FilingEvent::GitConflictsResolved {
                    branch,
                    head,
                    affected_pending_files,
                });
            }
            FetchAction::UpToDate | FetchAction::NoRemoteBranch => {
                debug!("{} up to date with origin", branch);
            }
        }
        Ok(report)
    }

    /// Push the branch; a non-fast-forward rejection fetches and retries once.
    pub async fn push(&self) -> Result<(), FilingError> {
        self.ensure_ready().await?;
        let _git = self.git_lock.lock().await;

        match self.network("push", repo::push).await? {
            PushOutcome::Pushed => {}
            PushOutcome::NothingToPush => {
                debug!("Nothing to push on {}", self.options.branch);
                return Ok(());
            }
            PushOutcome::Rejected(reason) => {
                info!("Push rejected ({}); fetching and retrying", reason);
                self.fetch_locked().await?;
                if let PushOutcome::Rejected(reason) = self.network("push", repo::push).await? {
                    return Err(FilingError::Git(format!(
                        "push rejected after retry: {}",
                        reason
                    )));
                }
            }
        }

        self.events.emit(FilingEvent::GitPushed {
            branch: self.options.branch.clone(),
        });
        Ok(())
    }

    pub async fn get_status(&self) -> Result<GitProviderStatus, FilingError> {
        self.ensure_ready().await?;
        let git = self.blocking("status", repo::status).await?;
        Ok(GitProviderStatus {
            git,
            pending_commits: self.queue.get_all_pending_commits().await.len(),
            locked_paths: self.locks.locked_paths().await?,
        })
    }

    // =========================================================================
    // Auto fetch
    // =========================================================================

    /// Start running `fetch` every `fetch_interval`. Returns false if already
    /// running.
    pub async fn start_auto_fetch(self: &Arc<Self>) -> bool {
        let mut slot = self.auto_fetch.lock().await;
        if slot.is_some() {
            return false;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        *slot = Some(PeriodicTask::start(
            "auto-fetch",
            self.options.fetch_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(provider) = weak.upgrade() {
                        if let Err(e) = provider.fetch().await {
                            warn!("Auto fetch failed: {}", e);
                        }
                    }
                }
                .boxed()
            },
        ));
        true
    }

    pub async fn stop_auto_fetch(&self) {
        let task = self.auto_fetch.lock().await.take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}

#[async_trait]
impl FilingProvider for GitFilingProvider {
    fn provider_name(&self) -> &'static str {
        "git"
    }

    /// Uninitialized -> Configured -> Ready.
    async fn initialize(&self) -> Result<(), FilingError> {
        if self.options.remote_url.trim().is_empty() {
            return Err(FilingError::InvalidArgument(
                "git provider needs a remote url".to_string(),
            ));
        }
        if self.options.branch.trim().is_empty() {
            return Err(FilingError::InvalidArgument(
                "git provider needs a branch".to_string(),
            ));
        }
        *self.phase.write().await = GitPhase::Configured;

        self.queue.initialize().await?;
        {
            let _git = self.git_lock.lock().await;
            self.network("clone", repo::prepare).await?;
        }
        *self.phase.write().await = GitPhase::Ready;

        info!(
            "Git provider ready: {} ({}) at {}",
            self.options.remote_url,
            self.options.branch,
            self.store.root().display()
        );
        Ok(())
    }

    #[instrument(skip(self, content), level = "debug", fields(content_len = content.len()))]
    async fn create(&self, path: &str, content: &[u8]) -> Result<(), FilingError> {
        self.write(path, content, "create").await?;
        self.events.emit(FilingEvent::FileCreated {
            path: normalize_file_path(path)?,
            provider: self.provider_name(),
        });
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, FilingError> {
        self.store.read(path).await
    }

    #[instrument(skip(self, content), level = "debug", fields(content_len = content.len()))]
    async fn update(&self, path: &str, content: &[u8]) -> Result<(), FilingError> {
        self.write(path, content, "update").await?;
        self.events.emit(FilingEvent::FileUpdated {
            path: normalize_file_path(path)?,
            provider: self.provider_name(),
        });
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, path: &str) -> Result<(), FilingError> {
        let key = normalize_file_path(path)?;
        self.ensure_ready().await?;
        self.ensure_not_locked_by_other(&key).await?;

        let _git = self.git_lock.lock().await;
        {
            let _job = self.job_lock.lock().await;
            self.store.delete(&key).await?;
        }
        self.stage_and_queue(&key, true, CommitMetadata::operation("delete", None))
            .await?;
        self.events.emit(FilingEvent::FileDeleted {
            path: key,
            provider: self.provider_name(),
        });
        Ok(())
    }

    async fn list(&self, dir_path: &str) -> Result<Vec<EntryInfo>, FilingError> {
        let entries = self.store.list(dir_path).await?;
        Ok(entries.into_iter().filter(|e| e.name != ".git").collect())
    }

    async fn exists(&self, path: &str) -> Result<bool, FilingError> {
        self.store.exists(path).await
    }

    async fn lock_file(&self, path: &str, reason: &str) -> Result<(), FilingError> {
        let key = normalize_file_path(path)?;
        self.locks
            .acquire(&key, &self.options.user_id, reason)
            .await?
            .into_result(&key)?;
        self.events.emit(FilingEvent::FileLocked {
            path: key,
            user_id: self.options.user_id.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn unlock_file(&self, path: &str) -> Result<(), FilingError> {
        let key = normalize_file_path(path)?;
        let result = self.locks.release(&key, &self.options.user_id).await?;
        if !result.released {
            return Err(FilingError::Ownership(format!(
                "{} cannot unlock {}: {}",
                self.options.user_id, key, result.reason
            )));
        }
        self.events.emit(FilingEvent::FileUnlocked {
            path: key,
            user_id: self.options.user_id.clone(),
        });
        Ok(())
    }

    /// Fetch then push. `synced` counts commits exchanged with origin.
    async fn synchronize(&self) -> Result<SyncSummary, FilingError> {
        let report = self.fetch().await?;
        self.push().await?;
        let pushed = match report.action {
            FetchAction::ResetToRemote => 0,
            _ => report.ahead,
        };
        Ok(SyncSummary {
            synced: report.behind + pushed,
            ..SyncSummary::default()
        })
    }
}

impl std::fmt::Debug for GitFilingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitFilingProvider")
            .field("options", &self.options)
            .field("workdir", &self.store.root())
            .field("locks", &self.locks.lock_type())
            .finish()
    }
}
