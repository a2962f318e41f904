//! Durable queue of change sets awaiting a human commit message.
//!
//! ```text
//! {queue_dir}/
//!   pending-commits.json     # [ PendingCommit, ... ]
//! ```
//!
//! Completion is a two-phase hand-off: the entry leaves the queue before the
//! caller commits, and the caller puts it back with `requeue` if the commit
//! fails. Commit intent is delivered at least once.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use filing_core::{CommitMetadata, CompletedCommit, FilingError, PendingCommit, QueueStats};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

const QUEUE_FILE: &str = "pending-commits.json";

#[derive(Debug)]
pub struct CommitQueue {
    queue_dir: PathBuf,
    pending: Mutex<Vec<PendingCommit>>,
    initialized: AtomicBool,
}

impl CommitQueue {
    pub fn new(queue_dir: impl AsRef<Path>) -> Self {
        Self {
            queue_dir: queue_dir.as_ref().to_path_buf(),
            pending: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
        }
    }

    fn queue_path(&self) -> PathBuf {
        self.queue_dir.join(QUEUE_FILE)
    }

    /// Load the queue, creating an empty one if absent.
    #[instrument(skip(self), level = "debug", fields(dir = %self.queue_dir.display()))]
    pub async fn initialize(&self) -> Result<(), FilingError> {
        fs::create_dir_all(&self.queue_dir).await.map_err(|e| {
            FilingError::Persistence(format!(
                "Failed to create queue dir {}: {}",
                self.queue_dir.display(),
                e
            ))
        })?;

        let path = self.queue_path();
        let mut pending = self.pending.lock().await;
        match fs::read_to_string(&path).await {
            Ok(json) => {
                *pending = serde_json::from_str(&json).map_err(|e| {
                    FilingError::Serialization(format!(
                        "Failed to parse {}: {}",
                        path.display(),
                        e
                    ))
                })?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                pending.clear();
                self.persist(&pending).await?;
            }
            Err(e) => {
                return Err(FilingError::Persistence(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!("Loaded {} pending commits", pending.len());
        Ok(())
    }

    async fn persist(&self, pending: &[PendingCommit]) -> Result<(), FilingError> {
        let path = self.queue_path();
        let json = serde_json::to_string_pretty(pending).map_err(|e| {
            FilingError::Serialization(format!("Failed to serialize commit queue: {}", e))
        })?;

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &json).await.map_err(|e| {
            FilingError::Persistence(format!("Failed to write commit queue: {}", e))
        })?;
        fs::rename(&temp_path, &path).await.map_err(|e| {
            FilingError::Persistence(format!("Failed to rename commit queue: {}", e))
        })?;
        Ok(())
    }

    /// Apply `f` to a copy of the queue and persist it; the live queue only
    /// changes when both succeed.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Vec<PendingCommit>) -> Result<T, FilingError>,
    ) -> Result<T, FilingError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(FilingError::NotInitialized(
                "commit queue has not been loaded".to_string(),
            ));
        }

        let mut pending = self.pending.lock().await;
        let mut next = pending.clone();
        let out = f(&mut next)?;
        self.persist(&next).await?;
        *pending = next;
        Ok(out)
    }

    /// Take the entry `id` out of `pending` after checking it belongs to `user_id`.
    fn take_owned(
        pending: &mut Vec<PendingCommit>,
        id: &str,
        user_id: &str,
    ) -> Result<PendingCommit, FilingError> {
        let pos = pending
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| FilingError::NotFound(format!("pending commit {}", id)))?;
        if pending[pos].user_id != user_id {
            return Err(FilingError::Ownership(format!(
                "pending commit {} belongs to {}, not {}",
                id, pending[pos].user_id, user_id
            )));
        }
        Ok(pending.remove(pos))
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Queue a change set and return its id.
    #[instrument(skip(self, metadata), level = "debug")]
    pub async fn add_pending_commit(
        &self,
        files: Vec<String>,
        user_id: &str,
        metadata: CommitMetadata,
    ) -> Result<String, FilingError> {
        if files.is_empty() {
            return Err(FilingError::InvalidArgument(
                "a pending commit needs at least one file".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let files: Vec<String> = files.into_iter().filter(|f| seen.insert(f.clone())).collect();

        let commit = PendingCommit {
            id: uuid::Uuid::new_v4().to_string(),
            files,
            user_id: user_id.to_string(),
            timestamp: Utc::now(),
            metadata,
        };
        let id = commit.id.clone();

        self.mutate(|pending| {
            pending.push(commit);
            Ok(())
        })
        .await?;

        debug!("Queued pending commit {} for {}", id, user_id);
        Ok(id)
    }

    /// Remove the entry and hand it to the caller for committing.
    #[instrument(skip(self), level = "debug")]
    pub async fn complete_pending_commit(
        &self,
        id: &str,
        commit_message: &str,
        user_id: &str,
    ) -> Result<CompletedCommit, FilingError> {
        if commit_message.trim().is_empty() {
            return Err(FilingError::InvalidArgument(
                "commit message must not be empty".to_string(),
            ));
        }

        let commit = self
            .mutate(|pending| Self::take_owned(pending, id, user_id))
            .await?;

        debug!("Completed pending commit {} ({} files)", id, commit.files.len());
        Ok(CompletedCommit {
            id: commit.id,
            files: commit.files,
            commit_message: commit_message.to_string(),
            user_id: commit.user_id,
            completed_at: Utc::now(),
            metadata: commit.metadata,
        })
    }

    /// Put a completed entry back after its commit failed. Returns the new id.
    #[instrument(skip(self, completed), level = "debug", fields(previous = %completed.id))]
    pub async fn requeue(&self, completed: &CompletedCommit) -> Result<String, FilingError> {
        let metadata = CommitMetadata {
            retry: true,
            attempts: completed.metadata.attempts + 1,
            ..completed.metadata.clone()
        };
        let id = self
            .add_pending_commit(completed.files.clone(), &completed.user_id, metadata)
            .await?;
        info!("Re-queued commit {} as {}", completed.id, id);
        Ok(id)
    }

    /// Discard an entry without committing.
    #[instrument(skip(self), level = "debug")]
    pub async fn cancel_pending_commit(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<PendingCommit, FilingError> {
        let commit = self
            .mutate(|pending| Self::take_owned(pending, id, user_id))
            .await?;
        debug!("Cancelled pending commit {}", id);
        Ok(commit)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_pending_commit(&self, id: &str) -> Option<PendingCommit> {
        self.pending.lock().await.iter().find(|c| c.id == id).cloned()
    }

    pub async fn get_all_pending_commits(&self) -> Vec<PendingCommit> {
        self.pending.lock().await.clone()
    }

    pub async fn get_pending_commits_by_user(&self, user_id: &str) -> Vec<PendingCommit> {
        self.pending
            .lock()
            .await
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Distinct files referenced by any pending commit.
    pub async fn pending_files(&self) -> Vec<String> {
        let pending = self.pending.lock().await;
        let mut seen = HashSet::new();
        pending
            .iter()
            .flat_map(|c| c.files.iter())
            .filter(|f| seen.insert(f.as_str()))
            .cloned()
            .collect()
    }

    pub async fn get_queue_stats(&self) -> QueueStats {
        let pending = self.pending.lock().await;
        let mut by_user: HashMap<String, usize> = HashMap::new();
        let mut files = HashSet::new();
        for commit in pending.iter() {
            *by_user.entry(commit.user_id.clone()).or_default() += 1;
            files.extend(commit.files.iter().map(String::as_str));
        }

        QueueStats {
            total: pending.len(),
            by_user,
            files_touched: files.len(),
            oldest_pending: pending.iter().map(|c| c.timestamp).min(),
        }
    }
}
