use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use filing_core::{FilingError, LockAcquireResult, LockManager, LockRecord, LockReleaseResult};
use tracing::{debug, instrument};

/// In-memory lock registry.
///
/// Locks live only as long as the process. This is the registry the git
/// provider uses unless a shared manager is injected.
#[derive(Debug, Default)]
pub struct MemoryLockManager {
    locks: DashMap<String, LockRecord>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    fn lock_type(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self), level = "debug")]
    async fn acquire(
        &self,
        path: &str,
        holder_id: &str,
        reason: &str,
    ) -> Result<LockAcquireResult, FilingError> {
        match self.locks.entry(path.to_string()) {
            Entry::Occupied(mut existing) => {
                if existing.get().user_id != holder_id {
                    debug!(
                        "Lock on {} held by {} (requested by {})",
                        path,
                        existing.get().user_id,
                        holder_id
                    );
                    return Ok(LockAcquireResult::held_by(existing.get().user_id.clone()));
                }
                existing.insert(LockRecord::new(holder_id, reason));
                debug!("Refreshed lock on {} for {}", path, holder_id);
            }
            Entry::Vacant(slot) => {
                slot.insert(LockRecord::new(holder_id, reason));
                debug!("Acquired lock on {} for {}", path, holder_id);
            }
        }
        Ok(LockAcquireResult::acquired())
    }

    #[instrument(skip(self), level = "debug")]
    async fn release(
        &self,
        path: &str,
        holder_id: &str,
    ) -> Result<LockReleaseResult, FilingError> {
        let Some(existing) = self.locks.get(path).map(|l| l.user_id.clone()) else {
            return Ok(LockReleaseResult {
                released: false,
                reason: "not_found".to_string(),
            });
        };

        if existing != holder_id {
            debug!(
                "Cannot release lock on {}: held by {} not {}",
                path, existing, holder_id
            );
            return Ok(LockReleaseResult {
                released: false,
                reason: "not_owner".to_string(),
            });
        }

        self.locks.remove_if(path, |_, lock| lock.user_id == holder_id);
        debug!("Released lock on {} by {}", path, holder_id);
        Ok(LockReleaseResult {
            released: true,
            reason: "ok".to_string(),
        })
    }

    async fn holder(&self, path: &str) -> Result<Option<LockRecord>, FilingError> {
        Ok(self.locks.get(path).map(|l| l.clone()))
    }

    async fn locked_paths(&self) -> Result<Vec<String>, FilingError> {
        let mut paths: Vec<String> = self.locks.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_release() {
        let locks = MemoryLockManager::new();

        let result = locks.acquire("a.txt", "alice", "editing").await.unwrap();
        assert!(result.acquired);

        let result2 = locks.acquire("a.txt", "bob", "editing").await.unwrap();
        assert!(!result2.acquired);
        assert_eq!(result2.current_holder.as_deref(), Some("alice"));

        let release = locks.release("a.txt", "bob").await.unwrap();
        assert!(!release.released);
        assert_eq!(release.reason, "not_owner");

        let release = locks.release("a.txt", "alice").await.unwrap();
        assert!(release.released);

        assert!(locks.acquire("a.txt", "bob", "").await.unwrap().acquired);
        assert_eq!(locks.locked_paths().await.unwrap(), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn test_reacquire_refreshes_reason() {
        let locks = MemoryLockManager::new();
        locks.acquire("a.txt", "alice", "first").await.unwrap();
        locks.acquire("a.txt", "alice", "second").await.unwrap();
        let holder = locks.holder("a.txt").await.unwrap().unwrap();
        assert_eq!(holder.reason, "second");
    }

    #[tokio::test]
    async fn test_release_missing() {
        let locks = MemoryLockManager::new();
        let release = locks.release("nope", "alice").await.unwrap();
        assert!(!release.released);
        assert_eq!(release.reason, "not_found");
    }
}
