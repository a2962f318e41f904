use async_trait::async_trait;

use crate::error::FilingError;
use crate::state::LockRecord;

/// Remote store abstraction consumed by the sync provider.
///
/// Paths are forward-slash relative paths (e.g., `docs/report.md`).
/// Implementations only need the basic object operations; lock propagation
/// is an optional capability advertised through `supports_locking`.
#[async_trait]
pub trait RemoteProvider: Send + Sync {
    /// Returns the backend identifier (e.g., "directory", "s3").
    fn backend_name(&self) -> &'static str;

    // =========================================================================
    // Object Operations
    // =========================================================================

    /// Create or overwrite the content at `path`.
    async fn create(&self, path: &str, content: &[u8]) -> Result<(), FilingError>;

    /// Read the content at `path`.
    ///
    /// Returns `FilingError::NotFound` when nothing was ever pushed there.
    async fn read(&self, path: &str) -> Result<Vec<u8>, FilingError>;

    /// Delete the content at `path`. Deleting a missing path is not an error.
    async fn delete(&self, path: &str) -> Result<(), FilingError>;

    /// List entry names directly under `dir_path` (empty string = root).
    async fn list(&self, dir_path: &str) -> Result<Vec<String>, FilingError>;

    // =========================================================================
    // Lock Operations (optional)
    // =========================================================================

    /// Whether this remote keeps its own lock registry.
    fn supports_locking(&self) -> bool {
        false
    }

    /// Record a lock on the remote.
    async fn lock_file(
        &self,
        path: &str,
        _user_id: &str,
        _reason: &str,
    ) -> Result<(), FilingError> {
        Err(FilingError::Unsupported(format!(
            "{} remote cannot lock {}",
            self.backend_name(),
            path
        )))
    }

    /// Release a lock on the remote.
    async fn unlock_file(&self, path: &str, _user_id: &str) -> Result<(), FilingError> {
        Err(FilingError::Unsupported(format!(
            "{} remote cannot unlock {}",
            self.backend_name(),
            path
        )))
    }

    /// Current lock on the remote, if any.
    async fn lock_holder(&self, _path: &str) -> Result<Option<LockRecord>, FilingError> {
        Ok(None)
    }
}
