use async_trait::async_trait;

use crate::error::FilingError;
use crate::state::LockRecord;

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone)]
pub struct LockAcquireResult {
    /// Whether the lock was acquired (or was already ours).
    pub acquired: bool,
    /// Current holder if the lock is held by someone else.
    pub current_holder: Option<String>,
}

impl LockAcquireResult {
    /// Create a successful acquisition result.
    pub fn acquired() -> Self {
        Self {
            acquired: true,
            current_holder: None,
        }
    }

    /// Create a failed acquisition result (lock held by another).
    pub fn held_by(holder: impl Into<String>) -> Self {
        Self {
            acquired: false,
            current_holder: Some(holder.into()),
        }
    }

    /// Turn a refused acquisition into `FilingError::LockConflict`.
    pub fn into_result(self, path: &str) -> Result<(), FilingError> {
        if self.acquired {
            Ok(())
        } else {
            Err(FilingError::LockConflict {
                path: path.to_string(),
                holder: self.current_holder.unwrap_or_else(|| "unknown".to_string()),
            })
        }
    }
}

/// Result of a lock release attempt.
#[derive(Debug, Clone)]
pub struct LockReleaseResult {
    pub released: bool,
    /// "ok", "not_owner" or "not_found"
    pub reason: String,
}

/// Advisory per-path lock registry.
///
/// Both the metadata store and the in-memory registry used by the git
/// provider implement this trait, so a caller can hand one shared manager to
/// several providers.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Returns the lock registry identifier (e.g., "metadata", "memory").
    fn lock_type(&self) -> &'static str;

    /// Attempt to lock `path` for `holder_id`.
    ///
    /// Re-acquiring a lock already held by `holder_id` refreshes it.
    async fn acquire(
        &self,
        path: &str,
        holder_id: &str,
        reason: &str,
    ) -> Result<LockAcquireResult, FilingError>;

    /// Release a lock.
    ///
    /// Only released if `holder_id` matches the current holder.
    async fn release(&self, path: &str, holder_id: &str)
        -> Result<LockReleaseResult, FilingError>;

    /// Current lock on `path`, if any.
    async fn holder(&self, path: &str) -> Result<Option<LockRecord>, FilingError>;

    /// All currently locked paths.
    async fn locked_paths(&self) -> Result<Vec<String>, FilingError>;
}
